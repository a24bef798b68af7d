//! Blocking commit waiters on real threads against standby replies and
//! reconfiguration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use syncrep::prelude::*;

fn coordinator(role: NodeRole, names: &str) -> Arc<SyncRep> {
    let config = ReplicationConfig {
        synchronous_standby_names: names.to_string(),
        max_wal_senders: 2,
        max_backends: 16,
        ..ReplicationConfig::default()
    };
    Arc::new(SyncRep::new(role, &config).unwrap())
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn every_commit_is_released_by_streaming_standby() {
    let rep = coordinator(NodeRole::Segment, "standby1");
    let insert = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let standby = {
        let rep = Arc::clone(&rep);
        let insert = Arc::clone(&insert);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let handle = rep.connect_standby("standby1").unwrap();
            rep.set_standby_state(&handle, WalSndState::Streaming);
            while !stop.load(Ordering::SeqCst) {
                let end = Lsn::new(insert.load(Ordering::SeqCst));
                rep.process_reply(&handle, end, end);
                thread::sleep(Duration::from_micros(200));
            }
            rep.disconnect_standby(handle);
        })
    };

    let committers: Vec<_> = (0..6)
        .map(|i| {
            let rep = Arc::clone(&rep);
            let insert = Arc::clone(&insert);
            thread::spawn(move || {
                let mut backend = rep.register_backend().unwrap();
                if i % 2 == 0 {
                    backend.set_synchronous_commit(SyncCommitLevel::RemoteWrite);
                }
                for _ in 0..50 {
                    let lsn = Lsn::new(insert.fetch_add(100, Ordering::SeqCst) + 100);
                    let outcome = rep.wait_for_lsn(&backend, lsn).unwrap();
                    assert!(matches!(
                        outcome,
                        WaitOutcome::Confirmed | WaitOutcome::AlreadyConfirmed
                    ));
                    assert!(rep.watermark(backend.synchronous_commit().wait_mode().unwrap()) >= lsn);
                }
                rep.cleanup_at_exit(backend);
            })
        })
        .collect();

    for committer in committers {
        committer.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    standby.join().unwrap();

    let snapshot = rep.snapshot();
    assert_eq!(snapshot.write_waiters, 0);
    assert_eq!(snapshot.flush_waiters, 0);
    assert_eq!(snapshot.backends, 0);
    assert_eq!(snapshot.flush_lsn, Lsn::new(insert.load(Ordering::SeqCst)));
}

#[test]
fn revoking_standbys_releases_blocked_commits() {
    let rep = coordinator(NodeRole::Segment, "standby1");
    let waiters: Vec<_> = (1..=5u64)
        .map(|i| {
            let rep = Arc::clone(&rep);
            let backend = rep.register_backend().unwrap();
            let id = backend.id();
            let waiter = thread::spawn(move || rep.wait_for_lsn(&backend, Lsn::new(i * 1000)));
            (id, waiter)
        })
        .collect();
    wait_until(|| waiters.iter().all(|(id, _)| rep.is_queued(*id)));

    let reload = ReplicationConfig {
        synchronous_standby_names: String::new(),
        max_backends: 16,
        ..ReplicationConfig::default()
    };
    rep.reload(&reload).unwrap();

    for (_, waiter) in waiters {
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Confirmed);
    }
    assert_eq!(rep.queue_len(WaitMode::Flush), 0);
    assert_eq!(rep.watermark(WaitMode::Flush), Lsn::INVALID);
}

#[test]
fn next_standby_takes_over_after_disconnect() {
    let rep = coordinator(NodeRole::Segment, "a, b");
    let a = rep.connect_standby("a").unwrap();
    let b = rep.connect_standby("b").unwrap();
    for handle in [&a, &b] {
        rep.set_standby_state(handle, WalSndState::Streaming);
    }

    let backend = rep.register_backend().unwrap();
    let id = backend.id();
    let waiter = {
        let rep = Arc::clone(&rep);
        thread::spawn(move || rep.wait_for_lsn(&backend, Lsn::new(500)))
    };
    wait_until(|| rep.is_queued(id));

    // The lower slot is elected, so the other session's reply is ignored
    rep.process_reply(&a, Lsn::new(100), Lsn::new(100));
    assert!(!rep.process_reply(&b, Lsn::new(600), Lsn::new(600)).elected);
    assert!(rep.is_queued(id));

    rep.disconnect_standby(a);
    let summary = rep.process_reply(&b, Lsn::new(600), Lsn::new(600));
    assert!(summary.elected);
    assert_eq!(summary.released_flush, 1);
    assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Confirmed);
}

#[test]
fn shutdown_and_supervisor_death_end_waits() {
    let rep = coordinator(NodeRole::Segment, "standby1");

    let backend = rep.register_backend().unwrap();
    let id = backend.id();
    let interrupt = backend.interrupt_handle();
    let waiter = {
        let rep = Arc::clone(&rep);
        thread::spawn(move || rep.wait_for_lsn(&backend, Lsn::new(10)))
    };
    wait_until(|| rep.is_queued(id));
    interrupt.request_shutdown();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, Error::AdministrativeShutdown));

    let others: Vec<_> = (0..3)
        .map(|_| {
            let rep = Arc::clone(&rep);
            let backend = rep.register_backend().unwrap();
            let id = backend.id();
            (id, thread::spawn(move || rep.wait_for_lsn(&backend, Lsn::new(20))))
        })
        .collect();
    wait_until(|| others.iter().all(|(id, _)| rep.is_queued(*id)));
    rep.mark_supervisor_dead();
    for (_, waiter) in others {
        assert!(matches!(waiter.join().unwrap(), Err(Error::SupervisorDown)));
    }
    assert_eq!(rep.queue_len(WaitMode::Flush), 0);
}
