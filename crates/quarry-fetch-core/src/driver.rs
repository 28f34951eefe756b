//! Transfer engine boundary: the batched driver protocol.
//!
//! The engine is an external collaborator consumed through this
//! socket-action/timeout notification protocol only. The multiplexer adds
//! and removes transfers, forwards socket readiness and timer expiry, and
//! drains completion notifications. Interest and timeout wishes flow the
//! other way: the engine pushes them into the caller-supplied
//! [`DriverSink`] while a `begin`/`advance`/`cancel` call is running, never
//! on its own thread.

use std::time::Duration;

use thiserror::Error;

use crate::error::TransportKind;
use crate::reactor::{Interest, Readiness, SocketRef};

/// Engine-assigned handle for one in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    /// Wrap a raw engine handle value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw engine handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// What a transfer fetches; carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTag {
    /// Metadata RPC query.
    Metadata,
    /// Snapshot archive download.
    Snapshot,
    /// Build recipe download.
    Recipe,
}

impl TransferTag {
    /// Short token for log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Snapshot => "snapshot",
            Self::Recipe => "recipe",
        }
    }
}

/// Everything the engine needs to run one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    /// Absolute request URL.
    pub url: String,
    /// Connection timeout; `None` disables the limit.
    pub connect_timeout: Option<Duration>,
    /// Diagnostic tag.
    pub tag: TransferTag,
}

/// Timer wish pushed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutChange {
    /// Engine is idle; disarm the timer.
    Disarm,
    /// Advance on the next loop iteration.
    Immediate,
    /// Arm a one-shot timer, replacing any armed deadline.
    After(Duration),
}

/// Sink for the side-effect requests the engine pushes during driver calls.
pub trait DriverSink {
    /// Watch `socket` with the given interest, or stop watching on `None`.
    fn socket_interest(&mut self, socket: SocketRef, interest: Option<Interest>);

    /// Replace the engine timer wish.
    fn timeout_change(&mut self, change: TimeoutChange);
}

/// Transport fault reported by the engine for a failed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    /// Failure classification.
    pub kind: TransportKind,
    /// Engine-reported detail.
    pub detail: String,
}

/// Terminal outcome of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Response delivered; transport succeeded.
    Delivered {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: Vec<u8>,
    },
    /// Transport failed before a response arrived.
    Failed(TransportFault),
}

/// Error type for driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transfer handle was unknown to the engine.
    #[error("unknown transfer")]
    UnknownTransfer {
        /// Offending handle.
        id: TransferId,
    },
    /// Engine rejected the operation.
    #[error("driver rejected operation")]
    Rejected {
        /// Operation identifier.
        operation: &'static str,
        /// Engine-reported detail.
        detail: String,
    },
}

/// Convenience alias for driver results.
pub type DriverResult<T> = Result<T, DriverError>;

/// Batched transfer engine consumed by the multiplexer.
pub trait TransferDriver {
    /// Register a new transfer. Non-blocking; interest and timeout wishes
    /// are pushed into `sink` before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine rejects the transfer outright.
    fn begin(&mut self, spec: TransferSpec, sink: &mut dyn DriverSink) -> DriverResult<TransferId>;

    /// Deregister and invalidate a transfer. Valid once per handle.
    ///
    /// # Errors
    ///
    /// Returns an error when the handle is unknown.
    fn cancel(&mut self, id: TransferId, sink: &mut dyn DriverSink) -> DriverResult<()>;

    /// Run one step of protocol processing for a ready socket.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot process the socket.
    fn advance_socket(
        &mut self,
        socket: SocketRef,
        readiness: Readiness,
        sink: &mut dyn DriverSink,
    ) -> DriverResult<()>;

    /// Run one step of protocol processing after the engine timer fired.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot make progress.
    fn advance_timer(&mut self, sink: &mut dyn DriverSink) -> DriverResult<()>;

    /// Drain completion notifications accumulated since the last drain.
    fn drain_completions(&mut self) -> Vec<(TransferId, TransferOutcome)>;
}
