// Unit tests for the work queue and its backoff helpers.

use citrine::core::process::queue::{WorkQueue, exponential_backoff, jitter};
use std::time::{Duration, Instant};

#[test]
fn dequeue_returns_only_ready_entries() {
    let queue = WorkQueue::new();
    queue.enqueue("later", Duration::from_secs(60));
    assert_eq!(queue.dequeue(), None);

    queue.enqueue("now", Duration::ZERO);
    assert_eq!(queue.dequeue(), Some("now".to_string()));
    assert_eq!(queue.dequeue(), None);
    assert_eq!(queue.len(), 1);
}

#[test]
fn entries_come_out_in_ready_order() {
    let queue = WorkQueue::new();
    queue.enqueue("c", Duration::from_millis(3));
    queue.enqueue("a", Duration::from_millis(1));
    queue.enqueue("b", Duration::from_millis(2));
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(queue.dequeue(), Some("a".to_string()));
    assert_eq!(queue.dequeue(), Some("b".to_string()));
    assert_eq!(queue.dequeue(), Some("c".to_string()));
}

#[test]
fn enqueue_tightens_the_ready_time() {
    let queue = WorkQueue::new();
    queue.enqueue("proc", Duration::from_secs(60));
    let long = queue.ready_at("proc").unwrap();

    queue.enqueue("proc", Duration::from_secs(1));
    let short = queue.ready_at("proc").unwrap();
    assert!(short < long, "an earlier enqueue must tighten the ready-time");
    assert_eq!(queue.len(), 1);
}

#[test]
fn later_enqueue_is_a_no_op() {
    let queue = WorkQueue::new();
    queue.enqueue("proc", Duration::from_secs(1));
    let stored = queue.ready_at("proc").unwrap();

    queue.enqueue("proc", Duration::from_secs(600));
    assert_eq!(
        queue.ready_at("proc").unwrap(),
        stored,
        "a later ready-time must not push the retry out"
    );
    assert_eq!(queue.len(), 1);
}

#[test]
fn stored_ready_time_is_the_minimum_of_both_enqueues() {
    let queue = WorkQueue::new();
    let before = Instant::now();
    queue.enqueue("proc", Duration::from_secs(30));
    queue.enqueue("proc", Duration::from_secs(5));
    let stored = queue.ready_at("proc").unwrap();

    let lower = before + Duration::from_secs(4);
    let upper = Instant::now() + Duration::from_secs(6);
    assert!(stored > lower && stored < upper);
}

#[tokio::test]
async fn enqueue_signals_the_wait_channel() {
    let queue = WorkQueue::new();
    queue.enqueue("x", Duration::ZERO);
    // The permit stored by the enqueue must complete an immediate wait.
    tokio::time::timeout(Duration::from_secs(1), queue.wait())
        .await
        .expect("wait() should fire after an enqueue");
}

#[test]
fn jitter_stays_inside_the_band() {
    let base = Duration::from_secs(10);
    for _ in 0..200 {
        let jittered = jitter(base, 0.25);
        assert!(jittered >= Duration::from_millis(7_500));
        assert!(jittered <= Duration::from_millis(12_500));
    }
    assert_eq!(jitter(base, 0.0), base);
}

#[test]
fn backoff_is_bounded_by_the_jittered_cap() {
    let base = Duration::from_secs(1);
    let max = Duration::from_secs(300);
    for attempt in 0..20u32 {
        let capped = base
            .saturating_mul(2u32.saturating_pow(attempt.min(31)))
            .min(max);
        for _ in 0..20 {
            let backoff = exponential_backoff(attempt, base, max);
            assert!(
                backoff >= capped.mul_f64(0.75) && backoff <= capped.mul_f64(1.25),
                "attempt {attempt}: {backoff:?} outside [{:?}, {:?}]",
                capped.mul_f64(0.75),
                capped.mul_f64(1.25)
            );
        }
    }
}

#[test]
fn backoff_never_exceeds_the_ceiling_band() {
    let max = Duration::from_secs(60);
    let backoff = exponential_backoff(40, Duration::from_secs(1), max);
    assert!(backoff <= max.mul_f64(1.25));
}
