//! Event loop boundary: socket, timer, and child-exit watch capability.
//!
//! The loop is an external collaborator. The multiplexer registers watches,
//! blocks in [`Reactor::poll_once`], and routes the delivered events back
//! into the transfer engine. Loop registrations are keyed by [`WatchId`],
//! a loop-side identifier space deliberately distinct from the engine-side
//! [`SocketRef`]; the bridge owns the translation between the two.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

/// Engine-side socket descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketRef(RawFd);

impl SocketRef {
    /// Wrap an engine-reported descriptor.
    #[must_use]
    pub const fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    /// Underlying raw descriptor.
    #[must_use]
    pub const fn raw(self) -> RawFd {
        self.0
    }
}

/// Readiness direction a socket watch subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable only.
    Read,
    /// Writable only.
    Write,
    /// Readable and writable.
    Both,
}

impl Interest {
    /// Whether the watch wants read readiness.
    #[must_use]
    pub const fn wants_read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    /// Whether the watch wants write readiness.
    #[must_use]
    pub const fn wants_write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

/// Readiness observed on a watched socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Data can be read (or the peer hung up).
    pub readable: bool,
    /// Data can be written.
    pub writable: bool,
    /// Error condition present on the descriptor.
    pub error: bool,
}

impl Readiness {
    /// Readiness reporting only the readable direction.
    #[must_use]
    pub const fn readable() -> Self {
        Self {
            readable: true,
            writable: false,
            error: false,
        }
    }
}

/// Loop-side identifier for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    /// Wrap a raw registration value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw registration value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Identifier of a watched child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildPid(i32);

impl ChildPid {
    /// Wrap a raw process id.
    #[must_use]
    pub const fn new(pid: i32) -> Self {
        Self(pid)
    }

    /// Raw process id.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

/// Exit classification captured from a watched child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Child exited with the given code.
    Exited(i32),
    /// Child was killed by the given signal.
    Signaled(i32),
}

impl ProcessStatus {
    /// Whether the child terminated successfully.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// One wakeup delivered by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorEvent {
    /// A watched socket became ready.
    SocketReady {
        /// Registration that fired.
        watch: WatchId,
        /// Readiness observed.
        readiness: Readiness,
    },
    /// The one-shot timer expired.
    TimerFired,
    /// A watched child terminated. The watch is released before delivery.
    ChildExited {
        /// Registration that fired.
        watch: WatchId,
        /// Child that terminated.
        pid: ChildPid,
        /// Captured exit classification.
        status: ProcessStatus,
    },
}

/// Error type for reactor operations.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Registration handle was unknown.
    #[error("unknown watch")]
    UnknownWatch {
        /// Offending registration.
        watch: WatchId,
    },
    /// Poll requested with nothing registered; the call could never return.
    #[error("poll requested with nothing registered")]
    Idle,
    /// Underlying OS call failed.
    #[error("os operation failed")]
    Os {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
}

/// Convenience alias for reactor results.
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Single-threaded event loop capability consumed by the multiplexer.
pub trait Reactor {
    /// Register a readiness watch for an engine socket.
    ///
    /// # Errors
    ///
    /// Returns an error when the loop cannot accept the registration.
    fn watch_socket(&mut self, socket: SocketRef, interest: Interest) -> ReactorResult<WatchId>;

    /// Replace the interest of an existing socket watch.
    ///
    /// # Errors
    ///
    /// Returns an error when the watch is unknown.
    fn rearm_socket(&mut self, watch: WatchId, interest: Interest) -> ReactorResult<()>;

    /// Remove a socket watch. Valid once per registration.
    ///
    /// # Errors
    ///
    /// Returns an error when the watch is unknown.
    fn unwatch_socket(&mut self, watch: WatchId) -> ReactorResult<()>;

    /// Arm the one-shot timer, replacing any armed deadline. A zero duration
    /// expires on the next poll.
    ///
    /// # Errors
    ///
    /// Returns an error when the timer cannot be armed.
    fn arm_timer(&mut self, after: Duration) -> ReactorResult<()>;

    /// Disarm the one-shot timer.
    ///
    /// # Errors
    ///
    /// Returns an error when the timer cannot be cleared.
    fn disarm_timer(&mut self) -> ReactorResult<()>;

    /// Watch a child process for termination. The watch fires once and is
    /// then released by the loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the loop cannot accept the registration.
    fn watch_child(&mut self, pid: ChildPid) -> ReactorResult<WatchId>;

    /// Remove a child watch that has not fired yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the watch is unknown.
    fn unwatch_child(&mut self, watch: WatchId) -> ReactorResult<()>;

    /// Block until at least one event is available and return the batch.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Idle`] when nothing is registered, or the OS
    /// failure that interrupted the poll.
    fn poll_once(&mut self) -> ReactorResult<Vec<ReactorEvent>>;
}
