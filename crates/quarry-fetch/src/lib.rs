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

//! Request multiplexer for the Quarry package repository.
//!
//! One [`Quarry`] façade owns the transfer driver, the reactor, and the
//! active set. Callers queue metadata queries, raw downloads, and clone
//! requests with a completion callback each, then block in [`Quarry::wait`]
//! until every callback fired or one of them cancelled the batch.
//!
//! Layout: `multiplexer.rs` (the façade and dispatch loop), `bridge.rs`
//! (driver wishes ↔ loop registrations), `active.rs` (active-set tracker),
//! `request.rs`/`response.rs` (request construction and completion
//! translation), `clone.rs` (child-process subsystem), `debug.rs` (request
//! trace side channel), `stub.rs` (scriptable stub driver).

mod active;
mod bridge;
mod clone;
mod debug;
mod multiplexer;
mod request;
mod response;
pub mod stub;

pub use multiplexer::{CloneCallback, MetadataCallback, Quarry, QueueHandle, RawCallback};
