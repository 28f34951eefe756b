#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Engine-agnostic fetch interfaces and DTOs.
//!
//! Layout: `model.rs` (request/response domain types), `error.rs` (the
//! `FetchError` taxonomy), `driver.rs` (the batched transfer engine
//! boundary), `reactor.rs` (the event loop boundary). The multiplexer in
//! `quarry-fetch` consumes both boundaries; `quarry-reactor` provides the
//! stock loop implementation.

pub mod driver;
pub mod error;
pub mod model;
pub mod reactor;

pub use error::{FetchError, FetchResult, TransportKind};
pub use model::{
    CloneAction, CloneReply, CloneRequest, DebugMode, Disposition, MetadataReply, MetadataRequest,
    PackageInfo, RawReply, RawRequest, SearchField,
};
