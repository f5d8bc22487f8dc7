use super::*;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

fn coordinator(dir: &tempfile::TempDir) -> MergeCoordinator {
    MergeCoordinator::new(
        StorePaths::new(dir.path().to_path_buf()),
        &GateConfig::default(),
    )
    .with_wait(Duration::from_secs(5), Duration::from_millis(10))
}

fn request(op: &str) -> AcquireRequest {
    AcquireRequest {
        operation_id: op.to_string(),
        actor: "tester".to_string(),
        operation_timeout: Duration::from_secs(60),
    }
}

#[test]
fn second_caller_times_out_while_first_holds() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let a = coordinator(&dir);
    let b = coordinator(&dir).with_wait(Duration::from_millis(200), Duration::from_millis(20));

    assert_eq!(
        a.acquire(&request("op1")).expect("op1 acquires"),
        AcquireOutcome::Acquired
    );
    let err = b.acquire(&request("op2")).expect_err("op2 must time out");
    match err {
        GateError::AcquireTimeout {
            operation_id,
            holder,
            ..
        } => {
            assert_eq!(operation_id, "op2");
            assert_eq!(holder.expect("holder reported").operation_id, "op1");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(b.queue_len().expect("queue"), 0);
    match a.status().expect("status") {
        LockState::Held { record, stale, .. } => {
            assert_eq!(record.operation_id, "op1");
            assert!(!stale);
        }
        LockState::Free => panic!("lock should still be held"),
    }
}

#[test]
fn try_acquire_reports_busy_holder() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let lock = coordinator(&dir);
    lock.acquire(&request("op1")).expect("acquire");
    match lock.try_acquire(&request("op2")).expect("try") {
        TryAcquire::Busy(holder) => assert_eq!(holder.operation_id, "op1"),
        other => panic!("expected busy, got {other:?}"),
    }
}

#[test]
fn only_holder_may_release() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let lock = coordinator(&dir);
    lock.acquire(&request("op1")).expect("acquire");
    let err = lock.release("op2").expect_err("not holder");
    assert!(matches!(err, GateError::NotHolder { .. }));
    lock.release("op1").expect("release");
    assert_eq!(lock.status().expect("status"), LockState::Free);
    assert!(matches!(
        lock.release("op1").expect_err("already free"),
        GateError::NotHolder { holder: None, .. }
    ));
}

#[test]
fn stale_holder_is_taken_over_and_audited() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let lock = coordinator(&dir);
    let abandoned = LockRecord {
        schema_version: LOCK_SCHEMA_VERSION,
        operation_id: "crashed".to_string(),
        pid: 4242,
        actor: "ci".to_string(),
        acquired_at_epoch_ms: now_epoch_ms() - 10_000,
        timeout_secs: 1,
    };
    write_json_atomic(&lock.paths.lock_record_path(), &abandoned).expect("seed record");
    assert!(matches!(
        lock.status().expect("status"),
        LockState::Held { stale: true, .. }
    ));

    let outcome = lock.acquire(&request("op2")).expect("takeover");
    assert_eq!(
        outcome,
        AcquireOutcome::StaleTakeover {
            previous: abandoned.clone()
        }
    );
    let audit = lock.audit_log().expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::StaleTakeover);
    assert_eq!(audit[0].previous.as_ref(), Some(&abandoned));
    assert_eq!(audit[0].by_operation.as_deref(), Some("op2"));
}

#[test]
fn force_release_clears_and_audits() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let lock = coordinator(&dir);
    lock.acquire(&request("op1")).expect("acquire");
    let previous = lock.force_release("admin").expect("force");
    assert_eq!(previous.expect("previous").operation_id, "op1");
    assert_eq!(lock.status().expect("status"), LockState::Free);
    let audit = lock.audit_log().expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::ForceRelease);
    assert_eq!(audit[0].actor, "admin");
}

#[test]
fn cancelled_waiter_leaves_queue_and_lock_untouched() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let holder = coordinator(&dir);
    holder.acquire(&request("op1")).expect("acquire");

    let cancel = Arc::new(AtomicBool::new(false));
    let waiter = coordinator(&dir);
    let flag = Arc::clone(&cancel);
    let handle = std::thread::spawn(move || waiter.acquire_with_cancel(&request("op2"), &flag));

    std::thread::sleep(Duration::from_millis(100));
    cancel.store(true, Ordering::SeqCst);
    let result = handle.join().expect("join");
    assert!(matches!(result, Err(GateError::Cancelled { .. })));
    assert_eq!(holder.queue_len().expect("queue"), 0);
    match holder.status().expect("status") {
        LockState::Held { record, .. } => assert_eq!(record.operation_id, "op1"),
        LockState::Free => panic!("holder lost the lock"),
    }
}

#[test]
fn waiters_are_served_in_arrival_order() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let holder = coordinator(&dir);
    holder.acquire(&request("first")).expect("acquire");
    let order = Arc::new(Mutex::new(Vec::new()));

    let spawn_waiter = |op: &'static str| {
        let lock = coordinator(&dir);
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            let outcome = lock.acquire(&request(op)).expect("acquire");
            assert!(matches!(outcome, AcquireOutcome::AcquiredAfterWait { .. }));
            order.lock().expect("order").push(op);
            std::thread::sleep(Duration::from_millis(30));
            lock.release(op).expect("release");
        })
    };

    let second = spawn_waiter("second");
    while holder.queue_len().expect("queue") < 1 {
        std::thread::sleep(Duration::from_millis(5));
    }
    let third = spawn_waiter("third");
    while holder.queue_len().expect("queue") < 2 {
        std::thread::sleep(Duration::from_millis(5));
    }
    holder.release("first").expect("release");
    second.join().expect("join second");
    third.join().expect("join third");
    assert_eq!(*order.lock().expect("order"), ["second", "third"]);
}

#[test]
fn holders_never_overlap() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..6)
        .map(|worker| {
            let lock = coordinator(&dir);
            let inside = Arc::clone(&inside);
            std::thread::spawn(move || {
                let op = format!("merge-{worker}");
                lock.acquire(&request(&op)).expect("acquire");
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                std::thread::sleep(Duration::from_millis(15));
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.release(&op).expect("release");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(
        coordinator(&dir).status().expect("status"),
        LockState::Free
    );
}

#[test]
fn staleness_uses_timeout_multiple() {
    let record = LockRecord {
        schema_version: LOCK_SCHEMA_VERSION,
        operation_id: "op".to_string(),
        pid: 1,
        actor: "a".to_string(),
        acquired_at_epoch_ms: 1_000,
        timeout_secs: 10,
    };
    assert!(!record.is_stale(21_000, 2));
    assert!(record.is_stale(21_001, 2));
    assert!(!record.is_stale(0, 2));
}

#[test]
fn non_blocking_attempt_never_overtakes_queued_waiters() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let holder = coordinator(&dir);
    holder.acquire(&request("op1")).expect("acquire");

    let waiter = coordinator(&dir).with_wait(Duration::from_secs(10), Duration::from_secs(1));
    let queued = std::thread::spawn(move || waiter.acquire(&request("op2")));
    while holder.queue_len().expect("queue") < 1 {
        std::thread::sleep(Duration::from_millis(5));
    }
    // Let the waiter finish its first attempt and start sleeping.
    std::thread::sleep(Duration::from_millis(100));
    holder.release("op1").expect("release");

    assert_eq!(
        holder.try_acquire(&request("op3")).expect("try"),
        TryAcquire::Queued { waiting: 1 }
    );
    assert_eq!(holder.status().expect("status"), LockState::Free);

    let outcome = queued.join().expect("join").expect("op2 acquires");
    assert!(matches!(outcome, AcquireOutcome::AcquiredAfterWait { .. }));
    match holder.try_acquire(&request("op3")).expect("try") {
        TryAcquire::Busy(current) => assert_eq!(current.operation_id, "op2"),
        other => panic!("expected busy, got {other:?}"),
    }
}

#[test]
fn non_blocking_attempt_succeeds_with_empty_queue() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let lock = coordinator(&dir);
    assert_eq!(
        lock.try_acquire(&request("op1")).expect("try"),
        TryAcquire::Acquired(AcquireOutcome::Acquired)
    );
    assert_eq!(lock.queue_len().expect("queue"), 0);
}
