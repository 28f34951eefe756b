//! Scriptable in-memory transfer engine.
//!
//! [`StubDriver`] is the test-suite's stand-in for a native engine binding
//! and a reference implementation of the driver protocol: it pushes
//! socket-interest and timeout wishes through the sink exactly the way a
//! real batched engine would. Clones share one underlying engine, so a test
//! can keep a handle for scripting and inspection while the multiplexer
//! owns another.
//!
//! When immediate work is pending, a timer advance completes only the
//! immediate transfers; timer-activated ones wait for the next advance.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use quarry_fetch_core::driver::{
    DriverError, DriverResult, DriverSink, TimeoutChange, TransferDriver, TransferId,
    TransferOutcome, TransferSpec, TransportFault,
};
use quarry_fetch_core::error::TransportKind;
use quarry_fetch_core::reactor::{Interest, Readiness, SocketRef};

/// How a scripted transfer comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Complete on the next engine timer advance.
    Immediate,
    /// Complete when the armed timer fires after the given delay.
    Timer(Duration),
    /// Complete when the given socket reports readiness.
    Socket(SocketRef, Interest),
    /// Stay live until cancelled.
    Stall,
}

#[derive(Debug, Clone)]
enum Plan {
    Respond { status: u16, body: Vec<u8> },
    Fail(TransportFault),
}

struct Rule {
    fragment: String,
    plan: Plan,
    activation: Activation,
}

struct LiveTransfer {
    plan: Plan,
    activation: Activation,
}

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    live: BTreeMap<TransferId, LiveTransfer>,
    done: Vec<(TransferId, TransferOutcome)>,
    next_id: u64,
    peak_live: usize,
}

impl Inner {
    fn refresh_timer(&self, sink: &mut dyn DriverSink) {
        if self
            .live
            .values()
            .any(|transfer| matches!(transfer.activation, Activation::Immediate))
        {
            sink.timeout_change(TimeoutChange::Immediate);
        } else if let Some(delay) = self
            .live
            .values()
            .filter_map(|transfer| match transfer.activation {
                Activation::Timer(delay) => Some(delay),
                _ => None,
            })
            .min()
        {
            sink.timeout_change(TimeoutChange::After(delay));
        } else {
            sink.timeout_change(TimeoutChange::Disarm);
        }
    }

    fn release_socket(&self, activation: Activation, sink: &mut dyn DriverSink) {
        if let Activation::Socket(socket, _) = activation {
            let still_used = self.live.values().any(
                |transfer| matches!(transfer.activation, Activation::Socket(s, _) if s == socket),
            );
            if !still_used {
                sink.socket_interest(socket, None);
            }
        }
    }

    fn complete(&mut self, id: TransferId, sink: &mut dyn DriverSink) {
        let Some(transfer) = self.live.remove(&id) else {
            return;
        };
        self.release_socket(transfer.activation, sink);
        let outcome = match transfer.plan {
            Plan::Respond { status, body } => TransferOutcome::Delivered { status, body },
            Plan::Fail(fault) => TransferOutcome::Failed(fault),
        };
        self.done.push((id, outcome));
    }
}

/// Scriptable transfer engine for tests and embedders without a native
/// binding.
#[derive(Clone, Default)]
pub struct StubDriver {
    inner: Rc<RefCell<Inner>>,
}

impl StubDriver {
    /// Engine with no scripted rules; unmatched URLs fail immediately with a
    /// connection fault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a delivered response for URLs containing `fragment`.
    pub fn respond(
        &self,
        fragment: impl Into<String>,
        activation: Activation,
        status: u16,
        body: impl Into<Vec<u8>>,
    ) {
        self.inner.borrow_mut().rules.push(Rule {
            fragment: fragment.into(),
            plan: Plan::Respond {
                status,
                body: body.into(),
            },
            activation,
        });
    }

    /// Script a transport fault for URLs containing `fragment`.
    pub fn fail(
        &self,
        fragment: impl Into<String>,
        activation: Activation,
        kind: TransportKind,
        detail: impl Into<String>,
    ) {
        self.inner.borrow_mut().rules.push(Rule {
            fragment: fragment.into(),
            plan: Plan::Fail(TransportFault {
                kind,
                detail: detail.into(),
            }),
            activation,
        });
    }

    /// Script a transfer that stays live until cancelled.
    pub fn stall(&self, fragment: impl Into<String>) {
        self.inner.borrow_mut().rules.push(Rule {
            fragment: fragment.into(),
            plan: Plan::Respond {
                status: 200,
                body: Vec::new(),
            },
            activation: Activation::Stall,
        });
    }

    /// Highest number of simultaneously live transfers observed.
    #[must_use]
    pub fn peak_live(&self) -> usize {
        self.inner.borrow().peak_live
    }

    /// Transfers currently live in the engine.
    #[must_use]
    pub fn live_now(&self) -> usize {
        self.inner.borrow().live.len()
    }
}

impl TransferDriver for StubDriver {
    fn begin(&mut self, spec: TransferSpec, sink: &mut dyn DriverSink) -> DriverResult<TransferId> {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = TransferId::new(inner.next_id);
        let (plan, activation) = inner
            .rules
            .iter()
            .find(|rule| spec.url.contains(&rule.fragment))
            .map_or_else(
                || {
                    (
                        Plan::Fail(TransportFault {
                            kind: TransportKind::Connection,
                            detail: format!("no route to {}", spec.url),
                        }),
                        Activation::Immediate,
                    )
                },
                |rule| (rule.plan.clone(), rule.activation),
            );
        if let Activation::Socket(socket, interest) = activation {
            sink.socket_interest(socket, Some(interest));
        }
        inner.live.insert(id, LiveTransfer { plan, activation });
        inner.peak_live = inner.peak_live.max(inner.live.len());
        inner.refresh_timer(sink);
        Ok(id)
    }

    fn cancel(&mut self, id: TransferId, sink: &mut dyn DriverSink) -> DriverResult<()> {
        let mut inner = self.inner.borrow_mut();
        let Some(transfer) = inner.live.remove(&id) else {
            return Err(DriverError::UnknownTransfer { id });
        };
        inner.release_socket(transfer.activation, sink);
        inner.refresh_timer(sink);
        Ok(())
    }

    fn advance_socket(
        &mut self,
        socket: SocketRef,
        _readiness: Readiness,
        sink: &mut dyn DriverSink,
    ) -> DriverResult<()> {
        let mut inner = self.inner.borrow_mut();
        let due: Vec<TransferId> = inner
            .live
            .iter()
            .filter(|(_, transfer)| {
                matches!(transfer.activation, Activation::Socket(s, _) if s == socket)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            inner.complete(id, sink);
        }
        inner.refresh_timer(sink);
        Ok(())
    }

    fn advance_timer(&mut self, sink: &mut dyn DriverSink) -> DriverResult<()> {
        let mut inner = self.inner.borrow_mut();
        let has_immediate = inner
            .live
            .values()
            .any(|transfer| matches!(transfer.activation, Activation::Immediate));
        let due: Vec<TransferId> = inner
            .live
            .iter()
            .filter(|(_, transfer)| match transfer.activation {
                Activation::Immediate => true,
                Activation::Timer(_) => !has_immediate,
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            inner.complete(id, sink);
        }
        inner.refresh_timer(sink);
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<(TransferId, TransferOutcome)> {
        std::mem::take(&mut self.inner.borrow_mut().done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_fetch_core::driver::TransferTag;

    #[derive(Default)]
    struct RecordingSink {
        interests: Vec<(SocketRef, Option<Interest>)>,
        timeouts: Vec<TimeoutChange>,
    }

    impl DriverSink for RecordingSink {
        fn socket_interest(&mut self, socket: SocketRef, interest: Option<Interest>) {
            self.interests.push((socket, interest));
        }

        fn timeout_change(&mut self, change: TimeoutChange) {
            self.timeouts.push(change);
        }
    }

    fn spec(url: &str) -> TransferSpec {
        TransferSpec {
            url: url.to_owned(),
            connect_timeout: None,
            tag: TransferTag::Metadata,
        }
    }

    #[test]
    fn immediate_transfers_complete_on_the_next_timer_advance() {
        let mut driver = StubDriver::new();
        driver.respond("/rpc/info", Activation::Immediate, 200, &b"{}"[..]);

        let mut sink = RecordingSink::default();
        let id = driver
            .begin(spec("https://q/rpc/info?name=a"), &mut sink)
            .expect("begin");
        assert_eq!(sink.timeouts, vec![TimeoutChange::Immediate]);

        driver.advance_timer(&mut sink).expect("advance");
        let completions = driver.drain_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, id);
        assert_eq!(driver.live_now(), 0);
        assert_eq!(sink.timeouts.last(), Some(&TimeoutChange::Disarm));
    }

    #[test]
    fn socket_transfers_release_their_interest_on_completion() {
        let mut driver = StubDriver::new();
        let socket = SocketRef::new(9);
        driver.respond(
            "/recipe/a",
            Activation::Socket(socket, Interest::Read),
            200,
            &b"recipe"[..],
        );

        let mut sink = RecordingSink::default();
        driver
            .begin(spec("https://q/recipe/a"), &mut sink)
            .expect("begin");
        assert_eq!(sink.interests, vec![(socket, Some(Interest::Read))]);

        driver
            .advance_socket(socket, Readiness::readable(), &mut sink)
            .expect("advance");
        assert_eq!(sink.interests.last(), Some(&(socket, None)));
        assert_eq!(driver.drain_completions().len(), 1);
    }

    #[test]
    fn unmatched_urls_fail_with_a_connection_fault() {
        let mut driver = StubDriver::new();
        let mut sink = RecordingSink::default();
        driver
            .begin(spec("https://q/rpc/info?name=ghost"), &mut sink)
            .expect("begin");
        driver.advance_timer(&mut sink).expect("advance");

        match driver.drain_completions().pop() {
            Some((_, TransferOutcome::Failed(fault))) => {
                assert_eq!(fault.kind, TransportKind::Connection);
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn cancelled_transfers_never_complete() {
        let mut driver = StubDriver::new();
        driver.stall("/archive/stuck");

        let mut sink = RecordingSink::default();
        let id = driver
            .begin(spec("https://q/archive/stuck.tar.gz"), &mut sink)
            .expect("begin");
        assert_eq!(driver.live_now(), 1);

        driver.cancel(id, &mut sink).expect("cancel");
        assert_eq!(driver.live_now(), 0);
        assert!(driver.drain_completions().is_empty());
        assert!(matches!(
            driver.cancel(id, &mut sink),
            Err(DriverError::UnknownTransfer { .. })
        ));
    }

    #[test]
    fn peak_concurrency_is_recorded() {
        let mut driver = StubDriver::new();
        driver.respond("/archive", Activation::Immediate, 200, &b"a"[..]);

        let mut sink = RecordingSink::default();
        driver
            .begin(spec("https://q/archive/a.tar.gz"), &mut sink)
            .expect("begin");
        driver
            .begin(spec("https://q/archive/b.tar.gz"), &mut sink)
            .expect("begin");
        driver.advance_timer(&mut sink).expect("advance");

        assert_eq!(driver.peak_live(), 2);
        assert_eq!(driver.live_now(), 0);
    }
}
