//! End-to-end multiplexer flows over the real poll reactor.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use quarry_fetch::Quarry;
use quarry_fetch::stub::{Activation, StubDriver};
use quarry_fetch_core::error::{FetchError, TransportKind};
use quarry_fetch_core::model::{Disposition, MetadataRequest, RawRequest};
use quarry_fetch_core::reactor::{Interest, SocketRef};
use quarry_reactor::PollReactor;

const BASE: &str = "https://quarry.example.org";
const INFO_BODY: &str =
    r#"{"status":"ok","error":null,"packages":[{"name":"foo","version":"2.0.1"}]}"#;

fn quarry_with(driver: &StubDriver) -> Result<Quarry> {
    Ok(Quarry::new(
        BASE,
        Box::new(driver.clone()),
        Box::new(PollReactor::new()?),
    ))
}

#[test]
fn metadata_and_raw_complete_before_wait_returns() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond("/rpc/info", Activation::Immediate, 200, INFO_BODY);
    driver.respond(
        "/archive/bar",
        Activation::Timer(Duration::from_millis(5)),
        200,
        &b"tarball"[..],
    );

    let mut quarry = quarry_with(&driver)?;
    let order = Rc::new(RefCell::new(Vec::new()));

    let seen = Rc::clone(&order);
    quarry.queue_metadata(MetadataRequest::info("foo"), move |_, reply| {
        let reply = reply.expect("metadata reply");
        assert_eq!(reply.packages.len(), 1);
        assert_eq!(reply.packages[0].name, "foo");
        seen.borrow_mut().push("metadata");
        Disposition::Continue
    });
    let seen = Rc::clone(&order);
    quarry.queue_raw(
        RawRequest::Snapshot { name: "bar".into() },
        move |_, reply| {
            assert_eq!(reply.expect("raw reply").body, b"tarball");
            seen.borrow_mut().push("raw");
            Disposition::Continue
        },
    );

    quarry.wait()?;
    // Engine-delivery order: the immediate metadata reply lands before the
    // timer-driven download, regardless of queue order.
    assert_eq!(*order.borrow(), vec!["metadata", "raw"]);
    assert_eq!(quarry.active_operations(), 0);
    assert_eq!(quarry.socket_watches(), 0);
    Ok(())
}

#[test]
fn every_queued_request_fires_exactly_one_callback() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond("/rpc/info", Activation::Immediate, 200, INFO_BODY);
    driver.respond("/archive", Activation::Immediate, 200, &b"a"[..]);
    driver.respond(
        "/recipe",
        Activation::Timer(Duration::from_millis(2)),
        200,
        &b"r"[..],
    );

    let mut quarry = quarry_with(&driver)?;
    let fired = Rc::new(RefCell::new(0_u32));
    for _ in 0..2 {
        let fired = Rc::clone(&fired);
        quarry.queue_metadata(MetadataRequest::info("foo"), move |_, _| {
            *fired.borrow_mut() += 1;
            Disposition::Continue
        });
    }
    let counter = Rc::clone(&fired);
    quarry.queue_raw(RawRequest::Snapshot { name: "x".into() }, move |_, _| {
        *counter.borrow_mut() += 1;
        Disposition::Continue
    });
    let counter = Rc::clone(&fired);
    quarry.queue_raw(RawRequest::Recipe { name: "y".into() }, move |_, _| {
        *counter.borrow_mut() += 1;
        Disposition::Continue
    });

    quarry.wait()?;
    assert_eq!(*fired.borrow(), 4);
    Ok(())
}

#[test]
fn cancel_discards_every_other_pending_callback() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond("/rpc/info", Activation::Immediate, 200, INFO_BODY);

    let mut quarry = quarry_with(&driver)?;
    let fired = Rc::new(RefCell::new(Vec::new()));
    for (label, verdict) in [
        ("first", Disposition::Continue),
        ("second", Disposition::Cancel),
        ("third", Disposition::Continue),
    ] {
        let fired = Rc::clone(&fired);
        quarry.queue_metadata(MetadataRequest::info("foo"), move |_, _| {
            fired.borrow_mut().push(label);
            verdict
        });
    }

    assert!(matches!(quarry.wait(), Err(FetchError::Cancelled)));
    // The third completion was drained in the same batch; its callback must
    // never run.
    assert_eq!(*fired.borrow(), vec!["first", "second"]);
    assert_eq!(quarry.active_operations(), 0);
    assert_eq!(driver.live_now(), 0);
    assert_eq!(quarry.socket_watches(), 0);
    Ok(())
}

#[test]
fn cancellation_tears_down_stalled_transfers() -> Result<()> {
    let driver = StubDriver::new();
    driver.stall("/archive/stuck");
    driver.respond("/rpc/info", Activation::Immediate, 200, INFO_BODY);

    let mut quarry = quarry_with(&driver)?;
    quarry.queue_raw(RawRequest::Snapshot { name: "stuck".into() }, |_, _| {
        unreachable!("stalled transfer must never complete")
    });
    quarry.queue_metadata(MetadataRequest::info("foo"), |_, _| Disposition::Cancel);

    assert!(matches!(quarry.wait(), Err(FetchError::Cancelled)));
    assert_eq!(driver.live_now(), 0);
    assert_eq!(quarry.active_operations(), 0);
    Ok(())
}

#[test]
fn connection_cap_limits_live_transfers() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond(
        "/archive",
        Activation::Timer(Duration::from_millis(2)),
        200,
        &b"a"[..],
    );

    let mut quarry = quarry_with(&driver)?;
    quarry.set_max_connections(1);
    let fired = Rc::new(RefCell::new(0_u32));
    for name in ["one", "two", "three"] {
        let fired = Rc::clone(&fired);
        quarry.queue_raw(RawRequest::Snapshot { name: name.into() }, move |_, _| {
            *fired.borrow_mut() += 1;
            Disposition::Continue
        });
    }

    quarry.wait()?;
    assert_eq!(*fired.borrow(), 3);
    assert_eq!(driver.peak_live(), 1);
    Ok(())
}

#[test]
fn connect_timeout_surfaces_as_transport_failure() -> Result<()> {
    let driver = StubDriver::new();
    driver.fail(
        "/archive/slow",
        Activation::Timer(Duration::from_millis(10)),
        TransportKind::Timeout,
        "connection timed out",
    );

    let mut quarry = quarry_with(&driver)?;
    quarry.set_connect_timeout(1);
    let observed = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&observed);
    quarry.queue_raw(RawRequest::Snapshot { name: "slow".into() }, move |_, reply| {
        *sink.borrow_mut() = Some(reply.expect_err("timed-out transfer"));
        Disposition::Continue
    });

    quarry.wait()?;
    assert!(matches!(
        *observed.borrow(),
        Some(FetchError::Transport {
            kind: TransportKind::Timeout,
            ..
        })
    ));
    Ok(())
}

#[test]
fn callbacks_can_queue_follow_up_requests() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond("/rpc/info", Activation::Immediate, 200, INFO_BODY);
    driver.respond("/archive/foo", Activation::Immediate, 200, &b"tarball"[..]);

    let mut quarry = quarry_with(&driver)?;
    let downloaded = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&downloaded);
    quarry.queue_metadata(MetadataRequest::info("foo"), move |queue, reply| {
        for package in &reply.expect("metadata reply").packages {
            let sink = Rc::clone(&sink);
            queue.queue_raw(
                RawRequest::Snapshot {
                    name: package.name.clone(),
                },
                move |_, raw| {
                    sink.borrow_mut().push(raw.expect("snapshot reply").body);
                    Disposition::Continue
                },
            );
        }
        Disposition::Continue
    });

    quarry.wait()?;
    assert_eq!(*downloaded.borrow(), vec![b"tarball".to_vec()]);
    Ok(())
}

#[test]
fn malformed_input_still_fires_the_callback_once() -> Result<()> {
    let driver = StubDriver::new();
    let mut quarry = quarry_with(&driver)?;
    let fired = Rc::new(RefCell::new(0_u32));
    let counter = Rc::clone(&fired);
    quarry.queue_metadata(
        MetadataRequest::Info { names: Vec::new() },
        move |_, reply| {
            assert!(matches!(reply, Err(FetchError::Configuration { .. })));
            *counter.borrow_mut() += 1;
            Disposition::Continue
        },
    );

    quarry.wait()?;
    assert_eq!(*fired.borrow(), 1);
    Ok(())
}

#[test]
fn socket_driven_transfers_ride_the_reactor() -> Result<()> {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    let (read_end, write_end) = nix::unistd::pipe()?;
    let driver = StubDriver::new();
    driver.respond(
        "/recipe/baz",
        Activation::Socket(SocketRef::new(read_end.as_raw_fd()), Interest::Read),
        200,
        &b"recipe"[..],
    );

    let mut quarry = quarry_with(&driver)?;
    let body = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&body);
    quarry.queue_raw(RawRequest::Recipe { name: "baz".into() }, move |_, reply| {
        *sink.borrow_mut() = reply.expect("recipe reply").body;
        Disposition::Continue
    });
    assert_eq!(quarry.socket_watches(), 1);

    File::from(write_end).write_all(b"x")?;
    quarry.wait()?;
    assert_eq!(*body.borrow(), b"recipe");
    assert_eq!(quarry.socket_watches(), 0);
    drop(read_end);
    Ok(())
}

#[test]
fn service_errors_surface_from_the_envelope() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond(
        "/rpc/info",
        Activation::Immediate,
        200,
        r#"{"status":"error","error":"rate limited"}"#,
    );

    let mut quarry = quarry_with(&driver)?;
    let observed = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&observed);
    quarry.queue_metadata(MetadataRequest::info("foo"), move |_, reply| {
        *sink.borrow_mut() = Some(reply.expect_err("service error"));
        Disposition::Continue
    });

    quarry.wait()?;
    match observed.borrow().as_ref() {
        Some(FetchError::Service { message }) => assert_eq!(message, "rate limited"),
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[test]
fn non_success_statuses_become_http_errors() -> Result<()> {
    let driver = StubDriver::new();
    driver.respond("/recipe/ghost", Activation::Immediate, 404, &b"not found"[..]);

    let mut quarry = quarry_with(&driver)?;
    let observed = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&observed);
    quarry.queue_raw(RawRequest::Recipe { name: "ghost".into() }, move |_, reply| {
        *sink.borrow_mut() = Some(reply.expect_err("missing recipe"));
        Disposition::Continue
    });

    quarry.wait()?;
    assert!(matches!(
        *observed.borrow(),
        Some(FetchError::HttpStatus { status: 404 })
    ));
    Ok(())
}

#[test]
fn unscripted_urls_fail_with_a_connection_fault() -> Result<()> {
    let driver = StubDriver::new();
    let mut quarry = quarry_with(&driver)?;
    let observed = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&observed);
    quarry.queue_raw(RawRequest::Snapshot { name: "ghost".into() }, move |_, reply| {
        *sink.borrow_mut() = Some(reply.expect_err("unrouted transfer"));
        Disposition::Continue
    });

    quarry.wait()?;
    assert!(matches!(
        *observed.borrow(),
        Some(FetchError::Transport {
            kind: TransportKind::Connection,
            ..
        })
    ));
    Ok(())
}
