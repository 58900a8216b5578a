//! Locking Module Tests
//!
//! ## Test Scopes
//! - **TimestampRwLock**: shared reads, exclusive writes, write preference, drop safety.
//! - **LockQueue**: FIFO readiness, single Ready request, expiration, tombstoned keys.

#[cfg(test)]
mod tests {
    use crate::locking::lock_request::{LockKey, LockQueue, LockState, Origin};
    use crate::locking::rw_lock::TimestampRwLock;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    const SHORT: Duration = Duration::from_millis(50);

    // ============================================================
    // READER / WRITER LOCK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_readers_share_the_lock() {
        let lock = TimestampRwLock::new();

        let r1 = lock.read(1).await;
        let r2 = lock.read(2).await;

        assert_eq!(lock.reader_count(), 2);
        drop(r1);
        drop(r2);
        assert_eq!(lock.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_waits_for_readers() {
        // ARRANGE
        let lock = TimestampRwLock::new();
        let reader = lock.read(1).await;

        // ACT: a writer queues behind the reader
        let lock_clone = lock.clone();
        let writer = tokio::spawn(async move {
            let _guard = lock_clone.write(2).await;
        });
        tokio::time::sleep(SHORT).await;

        // ASSERT
        assert!(!writer.is_finished());
        assert!(!lock.is_write_locked());

        drop(reader);
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should acquire after reader releases")
            .unwrap();
    }

    #[tokio::test]
    async fn test_earlier_writer_is_preferred_over_later_reader() {
        // ARRANGE: lock held, writer(5) then reader(10) queue up
        let lock = TimestampRwLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let holder = lock.write(0).await;

        let (l, o) = (lock.clone(), order.clone());
        let reader = tokio::spawn(async move {
            let _g = l.read(10).await;
            o.lock().await.push("read");
        });
        let (l, o) = (lock.clone(), order.clone());
        let writer = tokio::spawn(async move {
            let _g = l.write(5).await;
            o.lock().await.push("write");
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        tokio::time::sleep(SHORT).await;
        assert_eq!(lock.waiting_count(), 2);

        // ACT
        drop(holder);
        writer.await.unwrap();
        reader.await.unwrap();

        // ASSERT
        assert_eq!(*order.lock().await, vec!["write", "read"]);
    }

    #[tokio::test]
    async fn test_earlier_reader_joins_while_later_writer_waits() {
        let lock = TimestampRwLock::new();
        let existing = lock.read(1).await;

        let l = lock.clone();
        let writer = tokio::spawn(async move {
            let _g = l.write(50).await;
        });
        tokio::time::sleep(SHORT).await;

        // A reader older than the waiting writer is admitted immediately
        let early = tokio::time::timeout(Duration::from_secs(1), lock.read(10))
            .await
            .expect("earlier reader should not wait");
        assert_eq!(lock.reader_count(), 2);

        drop(existing);
        drop(early);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_the_lock() {
        let lock = TimestampRwLock::new();
        let holder = lock.write(1).await;

        // A writer that gives up while queued
        let timed_out = tokio::time::timeout(SHORT, lock.write(2)).await;
        assert!(timed_out.is_err());
        assert_eq!(lock.waiting_count(), 0);

        drop(holder);
        let _again = tokio::time::timeout(Duration::from_secs(1), lock.write(3))
            .await
            .expect("lock should be free");
    }

    // ============================================================
    // LOCK REQUEST QUEUE TESTS
    // ============================================================

    fn key(ts: i64, r: &str) -> LockKey {
        LockKey::new(ts, r)
    }

    #[tokio::test]
    async fn test_generated_keys_are_unique_and_sized() {
        let a = LockKey::generate(1);
        let b = LockKey::generate(1);
        assert_eq!(a.randomness.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_keys_order_by_timestamp_then_randomness() {
        assert!(key(1, "z") < key(2, "a"));
        assert!(key(2, "a") < key(2, "b"));
    }

    #[tokio::test]
    async fn test_requests_become_ready_in_ascending_order() {
        // ARRANGE: remote claims arrive out of order
        let queue = LockQueue::new("x", Duration::from_secs(30));
        let r3 = queue.register_remote(key(3000, "c")).unwrap();
        let r1 = queue.register_remote(key(1000, "a")).unwrap();
        let r2 = queue.register_remote(key(1000, "b")).unwrap();

        // ASSERT: first arrival took the slot, nothing else is ready
        assert_eq!(r3.state(), LockState::Ready);
        assert_eq!(r1.state(), LockState::Pending);
        assert_eq!(r2.state(), LockState::Pending);

        // ACT / ASSERT: each finish promotes the next-lowest key
        queue.set_finished(r3.key());
        assert_eq!(r1.state(), LockState::Ready);
        assert_eq!(r2.state(), LockState::Pending);

        queue.set_finished(r1.key());
        assert_eq!(r2.state(), LockState::Ready);

        queue.set_finished(r2.key());
        assert!(queue.is_empty());
        assert_eq!(r3.state(), LockState::Finished);
    }

    #[tokio::test]
    async fn test_at_most_one_ready_request() {
        let queue = LockQueue::new("x", Duration::from_secs(30));
        for i in 0..10 {
            queue.register_remote(key(100 - i, &format!("r{}", i)));
        }
        let ready = queue
            .outstanding()
            .iter()
            .filter(|k| queue.ready().as_ref() == Some(*k))
            .count();
        assert_eq!(ready, 1);
    }

    #[tokio::test]
    async fn test_announcing_local_request_holds_back_promotion() {
        // ARRANGE: two nodes claim concurrently, ours is later
        let queue = LockQueue::new("x", Duration::from_secs(30));
        let local = queue.register_local(key(1001, "local"));
        assert_eq!(local.origin(), Origin::Local);
        assert_eq!(local.state(), LockState::Pending);

        // ACT: during the broadcast we learn about an earlier remote claim
        let remote = queue.register_remote(key(1000, "remote")).unwrap();
        // the remote claim is earliest and not announcing, so it is ready
        assert_eq!(remote.state(), LockState::Ready);
        queue.announced(local.key());

        // ASSERT
        assert_eq!(local.state(), LockState::Pending);
        queue.delete(remote.key());
        assert_eq!(local.state(), LockState::Ready);
    }

    #[tokio::test]
    async fn test_earliest_announcing_request_blocks_everything() {
        let queue = LockQueue::new("x", Duration::from_secs(30));
        let local = queue.register_local(key(1000, "local"));
        let remote = queue.register_remote(key(1001, "remote")).unwrap();

        assert_eq!(remote.state(), LockState::Pending);
        queue.announced(local.key());
        assert_eq!(local.state(), LockState::Ready);
        assert_eq!(remote.state(), LockState::Pending);
    }

    #[tokio::test]
    async fn test_ready_request_expires() {
        // ARRANGE
        let queue = LockQueue::new("x", SHORT);
        let first = queue.register_remote(key(1, "a")).unwrap();
        let second = queue.register_remote(key(2, "b")).unwrap();

        // ACT: nobody finishes the first claim
        let became_ready = second.wait_ready(Duration::from_secs(2)).await;

        // ASSERT
        assert!(became_ready);
        assert_eq!(first.state(), LockState::Finished);
        assert_eq!(second.state(), LockState::Ready);
    }

    #[tokio::test]
    async fn test_local_and_remote_requests_expire_alike() {
        // ARRANGE: an abandoned local claim ahead of an abandoned peer claim
        let queue = LockQueue::new("x", SHORT);
        let local = queue.register_local(key(1, "local"));
        queue.announced(local.key());
        let remote = queue.register_remote(key(2, "remote")).unwrap();
        let last = queue.register_remote(key(3, "last")).unwrap();

        // ACT
        let became_ready = last.wait_ready(Duration::from_secs(2)).await;

        // ASSERT
        assert!(became_ready);
        assert_eq!(local.origin(), Origin::Local);
        assert_eq!(remote.origin(), Origin::Remote);
        assert_eq!(local.state(), LockState::Finished);
        assert_eq!(remote.state(), LockState::Finished);
        assert!(!queue.contains(local.key()));
    }

    #[tokio::test]
    async fn test_deleted_request_is_not_resurrected() {
        let queue = LockQueue::new("x", Duration::from_secs(30));
        let k = key(5, "late");

        // Cancellation arrives before the announcement
        assert!(!queue.delete(&k));
        assert!(queue.register_remote(k.clone()).is_none());
        assert!(!queue.contains(&k));
    }

    #[tokio::test]
    async fn test_set_finished_is_idempotent() {
        let queue = LockQueue::new("x", Duration::from_secs(30));
        let request = queue.register_remote(key(1, "a")).unwrap();

        assert!(queue.set_finished(request.key()));
        assert!(!queue.set_finished(request.key()));
        assert_eq!(request.state(), LockState::Finished);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_when_blocked() {
        let queue = LockQueue::new("x", Duration::from_secs(30));
        let _first = queue.register_remote(key(1, "a")).unwrap();
        let second = queue.register_remote(key(2, "b")).unwrap();

        assert!(!second.wait_ready(SHORT).await);
    }
}
