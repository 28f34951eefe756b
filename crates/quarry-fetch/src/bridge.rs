//! Event-loop bridge: driver wishes in, loop registrations out.
//!
//! The driver keys its socket requests by engine-side [`SocketRef`]; the
//! reactor keys registrations by its own [`WatchId`]. The two identifier
//! spaces are never assumed identical: the bridge maintains an explicit
//! bidirectional table and updates both directions together.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use quarry_fetch_core::driver::{
    DriverSink, TimeoutChange, TransferDriver, TransferId, TransferOutcome, TransferSpec,
};
use quarry_fetch_core::error::{FetchError, FetchResult, TransportKind};
use quarry_fetch_core::reactor::{
    Interest, Reactor, ReactorError, ReactorEvent, SocketRef, WatchId,
};

/// Socket-interest or timeout wish captured from the driver.
enum Notice {
    Socket {
        socket: SocketRef,
        interest: Option<Interest>,
    },
    Timeout(TimeoutChange),
}

/// Vec-backed sink handed to every driver call, drained before the call
/// returns to the façade.
#[derive(Default)]
struct NoticeQueue {
    notices: Vec<Notice>,
}

impl DriverSink for NoticeQueue {
    fn socket_interest(&mut self, socket: SocketRef, interest: Option<Interest>) {
        self.notices.push(Notice::Socket { socket, interest });
    }

    fn timeout_change(&mut self, change: TimeoutChange) {
        self.notices.push(Notice::Timeout(change));
    }
}

struct SocketEntry {
    watch: WatchId,
    interest: Interest,
}

/// Owns the driver and keeps the reactor synchronized with its wishes.
pub(crate) struct LoopBridge {
    driver: Box<dyn TransferDriver>,
    by_socket: HashMap<SocketRef, SocketEntry>,
    by_watch: HashMap<WatchId, SocketRef>,
    timer_armed: bool,
}

fn loop_fault(error: &ReactorError) -> FetchError {
    FetchError::Io {
        operation: "loop registration",
        source: io::Error::other(error.to_string()),
    }
}

impl LoopBridge {
    pub(crate) fn new(driver: Box<dyn TransferDriver>) -> Self {
        Self {
            driver,
            by_socket: HashMap::new(),
            by_watch: HashMap::new(),
            timer_armed: false,
        }
    }

    /// Hand a transfer to the driver and apply the wishes it pushed.
    pub(crate) fn begin_transfer(
        &mut self,
        spec: TransferSpec,
        reactor: &mut dyn Reactor,
    ) -> FetchResult<TransferId> {
        let mut sink = NoticeQueue::default();
        let id = self
            .driver
            .begin(spec, &mut sink)
            .map_err(|error| FetchError::Transport {
                kind: TransportKind::Io,
                detail: error.to_string(),
            })?;
        self.apply(sink, reactor)?;
        Ok(id)
    }

    /// Deregister a transfer; valid once per handle.
    pub(crate) fn cancel_transfer(
        &mut self,
        id: TransferId,
        reactor: &mut dyn Reactor,
    ) -> FetchResult<()> {
        let mut sink = NoticeQueue::default();
        if let Err(error) = self.driver.cancel(id, &mut sink) {
            warn!(error = %error, "driver cancel failed");
        }
        self.apply(sink, reactor)
    }

    /// Route one reactor wakeup into the driver; drained completions are
    /// appended to `completions`.
    pub(crate) fn handle_event(
        &mut self,
        event: ReactorEvent,
        reactor: &mut dyn Reactor,
        completions: &mut Vec<(TransferId, TransferOutcome)>,
    ) -> FetchResult<()> {
        match event {
            ReactorEvent::SocketReady { watch, readiness } => {
                let Some(socket) = self.by_watch.get(&watch).copied() else {
                    // Stale wakeup for a watch removed earlier in this batch.
                    return Ok(());
                };
                let mut sink = NoticeQueue::default();
                if let Err(error) = self.driver.advance_socket(socket, readiness, &mut sink) {
                    warn!(error = %error, socket = socket.raw(), "socket advance failed");
                }
                self.apply(sink, reactor)?;
            }
            ReactorEvent::TimerFired => {
                self.timer_armed = false;
                let mut sink = NoticeQueue::default();
                if let Err(error) = self.driver.advance_timer(&mut sink) {
                    warn!(error = %error, "timer advance failed");
                }
                self.apply(sink, reactor)?;
            }
            ReactorEvent::ChildExited { .. } => {
                // Clone completions bypass the driver; the façade handles
                // them before routing events here.
            }
        }
        completions.extend(self.driver.drain_completions());
        Ok(())
    }

    fn apply(&mut self, sink: NoticeQueue, reactor: &mut dyn Reactor) -> FetchResult<()> {
        for notice in sink.notices {
            match notice {
                Notice::Socket { socket, interest } => {
                    self.apply_socket(socket, interest, reactor)?;
                }
                Notice::Timeout(change) => self.apply_timeout(change, reactor)?,
            }
        }
        Ok(())
    }

    fn apply_socket(
        &mut self,
        socket: SocketRef,
        interest: Option<Interest>,
        reactor: &mut dyn Reactor,
    ) -> FetchResult<()> {
        match interest {
            None => {
                // Removing a socket the engine never registered is a no-op;
                // the request may repeat during teardown.
                if let Some(entry) = self.by_socket.remove(&socket) {
                    self.by_watch.remove(&entry.watch);
                    reactor
                        .unwatch_socket(entry.watch)
                        .map_err(|error| loop_fault(&error))?;
                    debug!(socket = socket.raw(), "socket watch dropped");
                }
            }
            Some(wanted) => {
                if let Some(entry) = self.by_socket.get_mut(&socket) {
                    // Re-requesting the current interest keeps the single
                    // existing watch.
                    if entry.interest != wanted {
                        reactor
                            .rearm_socket(entry.watch, wanted)
                            .map_err(|error| loop_fault(&error))?;
                        entry.interest = wanted;
                    }
                } else {
                    let watch = reactor
                        .watch_socket(socket, wanted)
                        .map_err(|error| loop_fault(&error))?;
                    self.by_socket.insert(
                        socket,
                        SocketEntry {
                            watch,
                            interest: wanted,
                        },
                    );
                    self.by_watch.insert(watch, socket);
                }
            }
        }
        Ok(())
    }

    fn apply_timeout(
        &mut self,
        change: TimeoutChange,
        reactor: &mut dyn Reactor,
    ) -> FetchResult<()> {
        match change {
            TimeoutChange::Disarm => {
                if self.timer_armed {
                    reactor.disarm_timer().map_err(|error| loop_fault(&error))?;
                    self.timer_armed = false;
                }
            }
            TimeoutChange::Immediate => {
                reactor
                    .arm_timer(Duration::ZERO)
                    .map_err(|error| loop_fault(&error))?;
                self.timer_armed = true;
            }
            TimeoutChange::After(delay) => {
                reactor
                    .arm_timer(delay)
                    .map_err(|error| loop_fault(&error))?;
                self.timer_armed = true;
            }
        }
        Ok(())
    }

    /// Remove every remaining loop registration exactly once.
    pub(crate) fn teardown(&mut self, reactor: &mut dyn Reactor) {
        for (socket, entry) in self.by_socket.drain() {
            self.by_watch.remove(&entry.watch);
            if let Err(error) = reactor.unwatch_socket(entry.watch) {
                warn!(error = %error, socket = socket.raw(), "socket watch release failed");
            }
        }
        self.by_watch.clear();
        if self.timer_armed {
            if let Err(error) = reactor.disarm_timer() {
                warn!(error = %error, "timer release failed");
            }
            self.timer_armed = false;
        }
    }

    pub(crate) fn socket_watch_count(&self) -> usize {
        self.by_socket.len()
    }
}
