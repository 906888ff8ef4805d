//! Timing tests for `src/perioder.rs` under tokio's paused test clock.
//!
//! The virtual clock makes the windows deterministic: margins of hundreds
//! of milliseconds absorb the real microseconds that pass between spawning
//! and arming a timer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use straylight::perioder::{Callback, Perioder, PerioderHandle, ReocEvent};

fn counting() -> (Arc<AtomicUsize>, Callback<()>) {
    let count = Arc::new(AtomicUsize::new(0));
    let cloned = Arc::clone(&count);
    (
        count,
        Arc::new(move |_now, _event| {
            cloned.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

struct Fixture {
    handle: PerioderHandle<()>,
    shutdown: watch::Sender<bool>,
}

fn fixture() -> Fixture {
    let (perioder, handle) = Perioder::<()>::new();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(perioder.run(shutdown_rx));
    Fixture { handle, shutdown }
}

/// Let spawned tasks arm their timers.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn past_start_catches_up_to_the_next_interval_boundary() {
    let fx = fixture();
    let (count, callback) = counting();

    // start = now - 0.5s, interval 4s: the first firing lands 3.5s out.
    let event = ReocEvent::new(
        Utc::now() - chrono::Duration::milliseconds(500),
        Duration::from_secs(4),
        None,
        "liveness",
        (),
        callback,
    )
    .expect("valid event");
    fx.handle.add(event);
    settle().await;

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0, "must not fire before 3s");

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "first firing within [3s, 5s]");

    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2, "then interval periodicity");

    let _ = fx.shutdown.send(true);
}

#[tokio::test(start_paused = true)]
async fn removal_stops_further_callbacks() {
    let fx = fixture();
    let (count, callback) = counting();

    let event = ReocEvent::new(
        Utc::now(),
        Duration::from_secs(1),
        None,
        "removable",
        (),
        callback,
    )
    .expect("valid event");
    fx.handle.add(event);
    settle().await;

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let before = count.load(Ordering::SeqCst);
    assert_eq!(before, 2, "fires at ~1s and ~2s");

    let id = *fx
        .handle
        .events()
        .keys()
        .next()
        .expect("one live event");
    fx.handle.remove(id);
    settle().await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        count.load(Ordering::SeqCst),
        before,
        "no callbacks after removal"
    );
    assert!(fx.handle.events().is_empty(), "removed event is gone");

    let _ = fx.shutdown.send(true);
}

#[tokio::test(start_paused = true)]
async fn past_deadline_never_starts() {
    let fx = fixture();
    let (count, callback) = counting();

    let event = ReocEvent::new(
        Utc::now() - chrono::Duration::seconds(10),
        Duration::from_secs(1),
        Some(Utc::now() - chrono::Duration::seconds(1)),
        "expired",
        (),
        callback,
    )
    .expect("valid event");
    fx.handle.add(event);
    settle().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(fx.handle.events().is_empty(), "never registered as live");

    let _ = fx.shutdown.send(true);
}

#[tokio::test(start_paused = true)]
async fn future_deadline_stops_the_event() {
    let fx = fixture();
    let (count, callback) = counting();

    // interval 4s, deadline 7s out: exactly one firing (at ~4s) survives.
    let event = ReocEvent::new(
        Utc::now(),
        Duration::from_secs(4),
        Some(Utc::now() + chrono::Duration::seconds(7)),
        "deadlined",
        (),
        callback,
    )
    .expect("valid event");
    fx.handle.add(event);
    settle().await;

    let live = fx.handle.events();
    let event = live.values().next().expect("one live event").clone();

    tokio::time::sleep(Duration::from_millis(5_990)).await;
    assert!(!event.stopped(), "still live just before the deadline");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(event.stopped(), "stopped within one tick after the deadline");
    assert_eq!(count.load(Ordering::SeqCst), 1, "no firing past the deadline");
    assert!(fx.handle.events().is_empty(), "snapshot excludes stopped events");

    let _ = fx.shutdown.send(true);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_every_event() {
    let fx = fixture();
    let (count_a, callback_a) = counting();
    let (count_b, callback_b) = counting();

    for (desc, callback) in [("a", callback_a), ("b", callback_b)] {
        let event = ReocEvent::new(Utc::now(), Duration::from_secs(1), None, desc, (), callback)
            .expect("valid event");
        fx.handle.add(event);
    }
    settle().await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 1);

    let _ = fx.shutdown.send(true);
    settle().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count_a.load(Ordering::SeqCst), 1, "no callbacks after shutdown");
    assert_eq!(count_b.load(Ordering::SeqCst), 1, "no callbacks after shutdown");
}

#[tokio::test(start_paused = true)]
async fn ids_are_assigned_monotonically_from_zero() {
    let fx = fixture();

    for desc in ["first", "second", "third"] {
        let (_count, callback) = counting();
        let event = ReocEvent::new(
            Utc::now(),
            Duration::from_secs(60),
            None,
            desc,
            (),
            callback,
        )
        .expect("valid event");
        fx.handle.add(event);
    }
    settle().await;

    let mut ids: Vec<u64> = fx.handle.events().keys().copied().collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);

    let events = fx.handle.events();
    assert_eq!(events[&0].desc, "first");
    assert_eq!(events[&2].desc, "third");

    let _ = fx.shutdown.send(true);
}
