//! Integration tests for the network thread.
//!
//! These tests drive a running thread through the public handle: name
//! resolution, timers and shutdown. Handshake admission on a running
//! thread is covered by the `shoal-tests` crate.

use std::sync::mpsc;
use std::time::Duration;

use shoal_core::config::ShoalConfig;
use shoal_core::thread::{CallbackTarget, NetThread, ResolveFamily};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_resolution_and_timers_run_on_thread() -> shoal_core::Result<()> {
    let config = ShoalConfig::for_testing();
    let mut thread = NetThread::create(&config.thread)?;
    thread.init_thread()?;
    let handle = thread.start_thread(Vec::<String>::new())?;

    let (done_tx, done_rx) = mpsc::channel();
    handle.resolver().resolve(
        CallbackTarget::unique(),
        "127.0.0.1",
        6881,
        ResolveFamily::V4,
        move |log: &mut Vec<String>, result| {
            for address in result.unwrap_or_default() {
                log.push(address.to_string());
            }
            let _ = done_tx.send(());
        },
    );
    done_rx.recv_timeout(WAIT).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    handle.callbacks().push(CallbackTarget::unique(), move |_, scheduler| {
        scheduler.wait_for(Duration::from_millis(20), move |log, _| {
            log.push("timer".to_string());
            let _ = done_tx.send(());
        });
    });
    done_rx.recv_timeout(WAIT).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    handle.resolver().resolve(
        CallbackTarget::unique(),
        "127.0.0.1",
        6881,
        ResolveFamily::V6,
        move |log: &mut Vec<String>, result| {
            if let Err(e) = result {
                log.push(format!("{:?}", e.kind()));
            }
            let _ = done_tx.send(());
        },
    );
    done_rx.recv_timeout(WAIT).unwrap();

    let log = handle.stop_thread_wait()?;
    assert_eq!(log, vec!["127.0.0.1:6881", "timer", "NotFound"]);
    Ok(())
}

#[test]
fn test_dropping_handle_stops_thread() -> shoal_core::Result<()> {
    let config = ShoalConfig::for_testing();
    let mut thread = NetThread::create(&config.thread)?;
    thread.init_thread()?;
    let handle = thread.start_thread(())?;

    let stats_before = handle.stats().polls();
    std::thread::sleep(Duration::from_millis(120));
    assert!(handle.stats().polls() > stats_before);

    drop(handle);
    Ok(())
}
