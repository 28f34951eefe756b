//! The multiplexer façade: queue operations, dispatch loop, cancellation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use quarry_fetch_core::driver::{TransferDriver, TransferSpec};
use quarry_fetch_core::error::{FetchError, FetchResult};
use quarry_fetch_core::model::{
    CloneAction, CloneReply, CloneRequest, DebugMode, Disposition, MetadataReply, MetadataRequest,
    RawReply, RawRequest,
};
use quarry_fetch_core::reactor::{Reactor, ReactorEvent};

use crate::active::{ActiveSet, CloneTicket, TransferTicket};
use crate::bridge::LoopBridge;
use crate::clone::{self, CloneChild};
use crate::debug::RequestTrace;
use crate::request;
use crate::response::{Completion, ResponseHandler};

/// Default per-connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Completion callback for metadata queries.
pub type MetadataCallback =
    Box<dyn FnOnce(&mut QueueHandle<'_>, FetchResult<MetadataReply>) -> Disposition>;

/// Completion callback for raw downloads.
pub type RawCallback =
    Box<dyn FnOnce(&mut QueueHandle<'_>, FetchResult<RawReply>) -> Disposition>;

/// Completion callback for clone requests.
pub type CloneCallback =
    Box<dyn FnOnce(&mut QueueHandle<'_>, FetchResult<CloneReply>) -> Disposition>;

enum Staged {
    Metadata {
        request: MetadataRequest,
        callback: MetadataCallback,
    },
    Raw {
        request: RawRequest,
        callback: RawCallback,
    },
    Clone {
        request: CloneRequest,
        callback: CloneCallback,
    },
}

/// Staging area callbacks use to queue follow-up requests mid-dispatch.
///
/// Staged requests are admitted by the dispatch work-list after the current
/// completion, never recursively.
pub struct QueueHandle<'a> {
    staged: &'a mut VecDeque<Staged>,
}

impl QueueHandle<'_> {
    /// Queue a metadata query to join the current active set.
    pub fn queue_metadata(
        &mut self,
        request: MetadataRequest,
        callback: impl FnOnce(&mut QueueHandle<'_>, FetchResult<MetadataReply>) -> Disposition
        + 'static,
    ) {
        self.staged.push_back(Staged::Metadata {
            request,
            callback: Box::new(callback),
        });
    }

    /// Queue a raw download to join the current active set.
    pub fn queue_raw(
        &mut self,
        request: RawRequest,
        callback: impl FnOnce(&mut QueueHandle<'_>, FetchResult<RawReply>) -> Disposition + 'static,
    ) {
        self.staged.push_back(Staged::Raw {
            request,
            callback: Box::new(callback),
        });
    }

    /// Queue a clone to join the current active set.
    pub fn queue_clone(
        &mut self,
        request: CloneRequest,
        callback: impl FnOnce(&mut QueueHandle<'_>, FetchResult<CloneReply>) -> Disposition
        + 'static,
    ) {
        self.staged.push_back(Staged::Clone {
            request,
            callback: Box::new(callback),
        });
    }
}

/// Transfer waiting for a free connection slot.
struct Backlogged {
    spec: TransferSpec,
    handler: ResponseHandler,
}

/// The request multiplexer, rooted at one repository base URL.
///
/// All queue operations are non-blocking; progress happens inside
/// [`Self::wait`], which runs the reactor on the calling thread until the
/// active set drains. Callbacks execute synchronously on that thread and
/// must not block.
pub struct Quarry {
    base_url: String,
    connect_timeout: Option<Duration>,
    max_connections: usize,
    git_binary: PathBuf,
    debug_mode: DebugMode,
    trace: RequestTrace,
    bridge: LoopBridge,
    reactor: Box<dyn Reactor>,
    active: ActiveSet,
    staged: VecDeque<Staged>,
    backlog: VecDeque<Backlogged>,
    ready: VecDeque<(ResponseHandler, Completion)>,
    cancelled: bool,
}

impl Quarry {
    /// Build a façade rooted at `base_url`, e.g. `https://quarry.example.org`.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        driver: Box<dyn TransferDriver>,
        reactor: Box<dyn Reactor>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_connections: 0,
            git_binary: PathBuf::from("git"),
            debug_mode: DebugMode::Off,
            trace: RequestTrace::disabled(),
            bridge: LoopBridge::new(driver),
            reactor,
            active: ActiveSet::default(),
            staged: VecDeque::new(),
            backlog: VecDeque::new(),
            ready: VecDeque::new(),
            cancelled: false,
        }
    }

    /// Cap simultaneous transfer connections; 0 lifts the cap.
    ///
    /// Enforced by an admission gate: excess transfers queue in FIFO order
    /// and are handed to the engine as slots free up. Clones hold no
    /// connection and bypass the gate.
    pub fn set_max_connections(&mut self, limit: usize) {
        self.max_connections = limit;
    }

    /// Per-connection timeout in seconds; 0 disables the limit. Applies to
    /// requests queued after the call.
    pub fn set_connect_timeout(&mut self, seconds: u64) {
        self.connect_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
    }

    /// Configure the observability side channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the request-trace file cannot be opened.
    pub fn set_debug(&mut self, mode: DebugMode) -> FetchResult<()> {
        self.trace.configure(&mode).map_err(|source| FetchError::Io {
            operation: "open request trace",
            source,
        })?;
        self.debug_mode = mode;
        Ok(())
    }

    /// Override the git binary used by the clone subsystem.
    pub fn set_git_binary(&mut self, path: impl Into<PathBuf>) {
        self.git_binary = path.into();
    }

    /// Queue a metadata query. The callback fires exactly once during
    /// [`Self::wait`], also when the request is rejected as malformed.
    pub fn queue_metadata(
        &mut self,
        request: MetadataRequest,
        callback: impl FnOnce(&mut QueueHandle<'_>, FetchResult<MetadataReply>) -> Disposition
        + 'static,
    ) {
        self.staged.push_back(Staged::Metadata {
            request,
            callback: Box::new(callback),
        });
        self.pump();
    }

    /// Queue a raw download (snapshot archive or build recipe).
    pub fn queue_raw(
        &mut self,
        request: RawRequest,
        callback: impl FnOnce(&mut QueueHandle<'_>, FetchResult<RawReply>) -> Disposition + 'static,
    ) {
        self.staged.push_back(Staged::Raw {
            request,
            callback: Box::new(callback),
        });
        self.pump();
    }

    /// Queue a source-repository clone.
    pub fn queue_clone(
        &mut self,
        request: CloneRequest,
        callback: impl FnOnce(&mut QueueHandle<'_>, FetchResult<CloneReply>) -> Disposition
        + 'static,
    ) {
        self.staged.push_back(Staged::Clone {
            request,
            callback: Box::new(callback),
        });
        self.pump();
    }

    /// Number of live pending operations, admitted or backlogged.
    #[must_use]
    pub fn active_operations(&self) -> usize {
        self.active.len() + self.backlog.len()
    }

    /// Number of live loop socket watches.
    #[must_use]
    pub fn socket_watches(&self) -> usize {
        self.bridge.socket_watch_count()
    }

    /// Run the loop until every queued operation completed.
    ///
    /// Callbacks run synchronously on this thread and may queue follow-up
    /// requests; those join the same active set and are observed before
    /// `wait` returns.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Cancelled`] when any callback asked for
    /// cancellation, or the loop failure that interrupted the reactor.
    pub fn wait(&mut self) -> FetchResult<()> {
        loop {
            self.pump();
            self.admit_backlog();
            if !self.ready.is_empty() {
                self.dispatch_ready();
                continue;
            }
            if self.cancelled {
                self.cancelled = false;
                return Err(FetchError::Cancelled);
            }
            if self.active.is_empty() && self.backlog.is_empty() && self.staged.is_empty() {
                return Ok(());
            }

            let events = match self.reactor.poll_once() {
                Ok(events) => events,
                Err(error) => {
                    warn!(error = %error, "reactor poll failed; tearing down");
                    self.cancel_internal();
                    self.cancelled = false;
                    return Err(FetchError::Io {
                        operation: "poll",
                        source: std::io::Error::other(error.to_string()),
                    });
                }
            };

            let mut completions = Vec::new();
            for event in events {
                match event {
                    ReactorEvent::ChildExited { watch, status, .. } => {
                        if let Some(ticket) = self.active.take_clone(watch) {
                            // The reactor already reaped the pid; dropping
                            // the child handle cannot double-wait.
                            self.ready.push_back((ticket.handler, Completion::Process(status)));
                        }
                    }
                    other => {
                        if let Err(error) =
                            self.bridge
                                .handle_event(other, self.reactor.as_mut(), &mut completions)
                        {
                            warn!(error = %error, "event routing failed");
                        }
                    }
                }
            }
            for (id, outcome) in completions {
                if let Some(ticket) = self.active.take_transfer(id) {
                    self.ready.push_back((ticket.handler, Completion::Transfer(outcome)));
                } else {
                    debug!(id = id.raw(), "completion for an unknown transfer dropped");
                }
            }
        }
    }

    /// Admit staged requests: build the transfer or spawn the child, record
    /// the pending operation, defer failures as synthetic completions.
    fn pump(&mut self) {
        while let Some(staged) = self.staged.pop_front() {
            if self.cancelled {
                // Queued after cancellation: fail without touching the
                // engine.
                let handler = match staged {
                    Staged::Metadata { callback, .. } => ResponseHandler::Metadata(callback),
                    Staged::Raw { callback, .. } => ResponseHandler::Raw(callback),
                    Staged::Clone { request, callback } => ResponseHandler::Clone {
                        callback,
                        action: CloneAction::Cloned,
                        workdir: PathBuf::from(&request.name),
                    },
                };
                self.ready.push_back((handler, Completion::Failed(FetchError::Cancelled)));
                continue;
            }
            match staged {
                Staged::Metadata { request, callback } => {
                    match request::metadata_spec(&self.base_url, &request, self.connect_timeout) {
                        Ok(spec) => self.admit(spec, ResponseHandler::Metadata(callback)),
                        Err(error) => self.ready.push_back((
                            ResponseHandler::Metadata(callback),
                            Completion::Failed(error),
                        )),
                    }
                }
                Staged::Raw { request, callback } => {
                    match request::raw_spec(&self.base_url, &request, self.connect_timeout) {
                        Ok(spec) => self.admit(spec, ResponseHandler::Raw(callback)),
                        Err(error) => self
                            .ready
                            .push_back((ResponseHandler::Raw(callback), Completion::Failed(error))),
                    }
                }
                Staged::Clone { request, callback } => self.admit_clone(request, callback),
            }
        }
    }

    fn admit(&mut self, spec: TransferSpec, handler: ResponseHandler) {
        if self.max_connections > 0 && self.active.transfer_count() >= self.max_connections {
            self.backlog.push_back(Backlogged { spec, handler });
            return;
        }
        self.trace.outbound(spec.tag.as_str(), &spec.url);
        let target = spec.url.clone();
        match self.bridge.begin_transfer(spec, self.reactor.as_mut()) {
            Ok(id) => self.active.insert_transfer(id, TransferTicket { handler, target }),
            Err(error) => self.ready.push_back((handler, Completion::Failed(error))),
        }
    }

    fn admit_backlog(&mut self) {
        while !self.cancelled
            && (self.max_connections == 0 || self.active.transfer_count() < self.max_connections)
        {
            let Some(next) = self.backlog.pop_front() else {
                break;
            };
            self.admit(next.spec, next.handler);
        }
    }

    fn admit_clone(&mut self, request: CloneRequest, callback: CloneCallback) {
        match clone::spawn(&self.git_binary, &self.base_url, &request, &self.debug_mode) {
            Ok(spawned) => {
                let CloneChild {
                    child,
                    pid,
                    action,
                    workdir,
                } = spawned;
                self.trace
                    .outbound("clone", &clone::clone_url(&self.base_url, &request.name));
                match self.reactor.watch_child(pid) {
                    Ok(watch) => self.active.insert_clone(
                        watch,
                        CloneTicket {
                            handler: ResponseHandler::Clone {
                                callback,
                                action,
                                workdir,
                            },
                            child,
                        },
                    ),
                    Err(error) => {
                        let mut child = child;
                        let _ = child.kill();
                        let _ = child.wait();
                        self.ready.push_back((
                            ResponseHandler::Clone {
                                callback,
                                action,
                                workdir,
                            },
                            Completion::Failed(FetchError::Io {
                                operation: "child watch",
                                source: std::io::Error::other(error.to_string()),
                            }),
                        ));
                    }
                }
            }
            Err(error) => {
                let workdir = request
                    .workdir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&request.name));
                self.ready.push_back((
                    ResponseHandler::Clone {
                        callback,
                        action: CloneAction::Cloned,
                        workdir,
                    },
                    Completion::Failed(error),
                ));
            }
        }
    }

    /// Dispatch the drained completions. Drains into a local batch first so
    /// callbacks queueing new work cannot re-enter the loop; a cancellation
    /// verdict discards the rest of the batch un-dispatched.
    fn dispatch_ready(&mut self) {
        let mut batch = std::mem::take(&mut self.ready);
        while let Some((handler, completion)) = batch.pop_front() {
            let mut handle = QueueHandle {
                staged: &mut self.staged,
            };
            if handler.dispatch(completion, &mut handle) == Disposition::Cancel {
                debug!("callback requested cancellation");
                drop(batch);
                self.cancel_internal();
                return;
            }
        }
    }

    /// Tear down every pending operation and loop registration exactly
    /// once, without invoking their callbacks.
    fn cancel_internal(&mut self) {
        self.cancelled = true;
        self.staged.clear();
        self.backlog.clear();
        self.ready.clear();

        let (transfers, clones) = self.active.drain();
        for (id, ticket) in transfers {
            debug!(url = %ticket.target, "cancelling transfer");
            if let Err(error) = self.bridge.cancel_transfer(id, self.reactor.as_mut()) {
                warn!(error = %error, "transfer cancel failed");
            }
        }
        for (watch, mut ticket) in clones {
            if let Err(error) = self.reactor.unwatch_child(watch) {
                warn!(error = %error, "child watch release failed");
            }
            if ticket.child.kill().is_ok() {
                let _ = ticket.child.wait();
            }
        }
        self.bridge.teardown(self.reactor.as_mut());
    }
}

impl Drop for Quarry {
    fn drop(&mut self) {
        // Every loop registration must be released before the engine state
        // goes away.
        if !self.active.is_empty() || !self.backlog.is_empty() || self.socket_watches() > 0 {
            self.cancel_internal();
        }
    }
}
