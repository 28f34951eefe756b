#![deny(unsafe_code)]
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

//! Poll-based single-threaded reactor.
//!
//! [`PollReactor`] is the stock implementation of the event loop capability
//! defined in `quarry-fetch-core`: socket readiness via poll(2), a one-shot
//! timer via a timerfd, and child-exit watches via a signalfd with `SIGCHLD`
//! masked. The calling thread's signal mask is saved on construction and
//! restored on drop.
//!
//! signalfd only observes `SIGCHLD` while every thread keeps it masked;
//! threads this crate does not control (the test harness, embedder threads)
//! may consume it instead. While child watches exist the poll tick is
//! therefore bounded and registered pids are reaped explicitly, so a lost
//! signal delays a child event by at most one tick.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal, SigmaskHow, pthread_sigmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use quarry_fetch_core::reactor::{
    ChildPid, Interest, ProcessStatus, Reactor, ReactorError, ReactorEvent, ReactorResult,
    Readiness, SocketRef, WatchId,
};

/// Poll tick while child watches are registered, in milliseconds.
const CHILD_TICK_MS: u8 = 50;

#[derive(Debug, Clone, Copy)]
struct SocketWatch {
    socket: SocketRef,
    interest: Interest,
}

/// Stock reactor: poll(2) plus a timerfd and a `SIGCHLD` signalfd.
pub struct PollReactor {
    timer: TimerFd,
    signals: SignalFd,
    saved_mask: SigSet,
    sockets: HashMap<WatchId, SocketWatch>,
    children: HashMap<WatchId, ChildPid>,
    next_watch: u64,
    timer_armed: bool,
}

fn os_err(operation: &'static str, errno: Errno) -> ReactorError {
    ReactorError::Os {
        operation,
        source: io::Error::from_raw_os_error(errno as i32),
    }
}

// The engine owns the watched descriptors; the reactor only polls them.
#[allow(unsafe_code)]
fn borrow_fd<'fd>(fd: RawFd) -> BorrowedFd<'fd> {
    // SAFETY: a descriptor stays open while its watch is registered; the
    // bridge removes the watch before the engine closes the socket.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl PollReactor {
    /// Create a reactor with `SIGCHLD` routed to the loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the timer or signal descriptor cannot be
    /// created, or the signal mask cannot be adjusted.
    pub fn new() -> ReactorResult<Self> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|errno| os_err("timerfd_create", errno))?;

        let mut chld = SigSet::empty();
        chld.add(Signal::SIGCHLD);
        let mut saved_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&chld), Some(&mut saved_mask))
            .map_err(|errno| os_err("pthread_sigmask", errno))?;

        let signals =
            match SignalFd::with_flags(&chld, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
                Ok(signals) => signals,
                Err(errno) => {
                    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&saved_mask), None);
                    return Err(os_err("signalfd", errno));
                }
            };

        Ok(Self {
            timer,
            signals,
            saved_mask,
            sockets: HashMap::new(),
            children: HashMap::new(),
            next_watch: 0,
            timer_armed: false,
        })
    }

    /// Number of live socket watches.
    #[must_use]
    pub fn socket_watches(&self) -> usize {
        self.sockets.len()
    }

    /// Number of live child watches.
    #[must_use]
    pub fn child_watches(&self) -> usize {
        self.children.len()
    }

    /// Whether the one-shot timer is armed.
    #[must_use]
    pub const fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    fn allocate_watch(&mut self) -> WatchId {
        self.next_watch += 1;
        WatchId::new(self.next_watch)
    }

    fn drain_signals(&mut self) -> ReactorResult<()> {
        loop {
            match self.signals.read_signal() {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(os_err("signalfd_read", errno)),
            }
        }
    }

    fn reap_children(&mut self) -> Vec<ReactorEvent> {
        let mut fired = Vec::new();
        self.children.retain(|watch, pid| {
            match waitpid(Pid::from_raw(pid.raw()), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    fired.push(ReactorEvent::ChildExited {
                        watch: *watch,
                        pid: *pid,
                        status: ProcessStatus::Exited(code),
                    });
                    false
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    fired.push(ReactorEvent::ChildExited {
                        watch: *watch,
                        pid: *pid,
                        status: ProcessStatus::Signaled(signal as i32),
                    });
                    false
                }
                Ok(_) => true,
                Err(Errno::ECHILD) => {
                    // Reaped by an external party; the exit status is lost.
                    warn!(pid = pid.raw(), "child was reaped outside the loop");
                    fired.push(ReactorEvent::ChildExited {
                        watch: *watch,
                        pid: *pid,
                        status: ProcessStatus::Exited(-1),
                    });
                    false
                }
                Err(errno) => {
                    warn!(pid = pid.raw(), error = %errno, "waitpid failed");
                    true
                }
            }
        });
        fired
    }
}

impl Reactor for PollReactor {
    fn watch_socket(&mut self, socket: SocketRef, interest: Interest) -> ReactorResult<WatchId> {
        let watch = self.allocate_watch();
        self.sockets.insert(watch, SocketWatch { socket, interest });
        debug!(socket = socket.raw(), watch = watch.raw(), "socket watch added");
        Ok(watch)
    }

    fn rearm_socket(&mut self, watch: WatchId, interest: Interest) -> ReactorResult<()> {
        match self.sockets.get_mut(&watch) {
            Some(entry) => {
                entry.interest = interest;
                Ok(())
            }
            None => Err(ReactorError::UnknownWatch { watch }),
        }
    }

    fn unwatch_socket(&mut self, watch: WatchId) -> ReactorResult<()> {
        match self.sockets.remove(&watch) {
            Some(entry) => {
                debug!(socket = entry.socket.raw(), watch = watch.raw(), "socket watch removed");
                Ok(())
            }
            None => Err(ReactorError::UnknownWatch { watch }),
        }
    }

    fn arm_timer(&mut self, after: Duration) -> ReactorResult<()> {
        // A zero expiration would disarm the timerfd; clamp to the smallest
        // representable deadline so an immediate wish still fires.
        let after = after.max(Duration::from_nanos(1));
        self.timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(after)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|errno| os_err("timerfd_settime", errno))?;
        self.timer_armed = true;
        Ok(())
    }

    fn disarm_timer(&mut self) -> ReactorResult<()> {
        self.timer
            .unset()
            .map_err(|errno| os_err("timerfd_settime", errno))?;
        self.timer_armed = false;
        Ok(())
    }

    fn watch_child(&mut self, pid: ChildPid) -> ReactorResult<WatchId> {
        let watch = self.allocate_watch();
        self.children.insert(watch, pid);
        debug!(pid = pid.raw(), watch = watch.raw(), "child watch added");
        Ok(watch)
    }

    fn unwatch_child(&mut self, watch: WatchId) -> ReactorResult<()> {
        match self.children.remove(&watch) {
            Some(_) => Ok(()),
            None => Err(ReactorError::UnknownWatch { watch }),
        }
    }

    fn poll_once(&mut self) -> ReactorResult<Vec<ReactorEvent>> {
        if self.sockets.is_empty() && self.children.is_empty() && !self.timer_armed {
            return Err(ReactorError::Idle);
        }

        loop {
            let mut order: Vec<WatchId> = self.sockets.keys().copied().collect();
            order.sort_unstable();

            let (timer_ready, signal_ready, socket_hits) = {
                let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(order.len() + 2);
                fds.push(PollFd::new(self.timer.as_fd(), PollFlags::POLLIN));
                fds.push(PollFd::new(self.signals.as_fd(), PollFlags::POLLIN));
                for id in &order {
                    let watch = self.sockets[id];
                    let mut flags = PollFlags::empty();
                    if watch.interest.wants_read() {
                        flags |= PollFlags::POLLIN;
                    }
                    if watch.interest.wants_write() {
                        flags |= PollFlags::POLLOUT;
                    }
                    fds.push(PollFd::new(borrow_fd(watch.socket.raw()), flags));
                }

                let timeout = if self.children.is_empty() {
                    PollTimeout::NONE
                } else {
                    PollTimeout::from(CHILD_TICK_MS)
                };
                match poll(&mut fds, timeout) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(os_err("poll", errno)),
                }

                let ready =
                    |slot: &PollFd<'_>| slot.revents().is_some_and(|revents| !revents.is_empty());
                let timer_ready = ready(&fds[0]);
                let signal_ready = ready(&fds[1]);
                let mut socket_hits = Vec::new();
                for (slot, id) in order.iter().enumerate() {
                    if let Some(revents) = fds[slot + 2].revents() {
                        let readiness = Readiness {
                            readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                            writable: revents.contains(PollFlags::POLLOUT),
                            error: revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
                        };
                        if readiness.readable || readiness.writable || readiness.error {
                            socket_hits.push((*id, readiness));
                        }
                    }
                }
                (timer_ready, signal_ready, socket_hits)
            };

            let mut events = Vec::new();
            if timer_ready {
                // One-shot semantics: clearing the timerfd also clears its
                // read readiness for the next poll.
                self.timer
                    .unset()
                    .map_err(|errno| os_err("timerfd_settime", errno))?;
                self.timer_armed = false;
                events.push(ReactorEvent::TimerFired);
            }
            if signal_ready {
                self.drain_signals()?;
            }
            // Reap watched children regardless of signal delivery: another,
            // unmasked thread may have consumed SIGCHLD.
            events.extend(self.reap_children());
            for (watch, readiness) in socket_hits {
                events.push(ReactorEvent::SocketReady { watch, readiness });
            }

            if !events.is_empty() {
                return Ok(events);
            }
        }
    }
}

impl Drop for PollReactor {
    fn drop(&mut self) {
        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None) {
            warn!(error = %errno, "failed to restore signal mask");
        }
    }
}
