//! Fast/slow partitions lend idle slots only after the borrow window

use ojp_proxy::segregation::{SlotKind, SlotManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(10);

fn ten_slots() -> Arc<SlotManager> {
    Arc::new(SlotManager::new(10, 0.2, WINDOW, true))
}

#[tokio::test(start_paused = true)]
async fn test_fast_request_borrows_after_slow_partition_idles() {
    let slots = ten_slots();
    let status = slots.status();
    assert_eq!((status.fast_slots, status.slow_slots), (8, 2));

    let mut held = Vec::new();
    for _ in 0..8 {
        held.push(slots.acquire(SlotKind::Fast, Duration::ZERO).await.unwrap());
    }
    held.push(slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap());

    // Inside the window the spare slow slot is not lent out
    assert!(slots.acquire(SlotKind::Fast, Duration::from_secs(5)).await.is_none());
    assert_eq!(slots.borrows_from(SlotKind::Slow), 0);

    let started = Instant::now();
    let borrowed = slots
        .acquire(SlotKind::Fast, Duration::from_secs(20))
        .await
        .unwrap();
    // The slow partition was last active at t=0, so borrowing opens at t=10s
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(borrowed.is_borrowed());
    assert_eq!(borrowed.kind(), SlotKind::Fast);
    assert_eq!(slots.borrows_from(SlotKind::Slow), 1);

    let status = slots.status();
    assert_eq!(status.active_fast, 9);
    assert_eq!(status.slow_lent_to_fast, 1);

    drop(borrowed);
    let status = slots.status();
    assert_eq!(status.active_fast, 8);
    assert_eq!(status.slow_lent_to_fast, 0);
}

#[tokio::test(start_paused = true)]
async fn test_recent_activity_restarts_the_window() {
    let slots = ten_slots();
    let mut held = Vec::new();
    for _ in 0..8 {
        held.push(slots.acquire(SlotKind::Fast, Duration::ZERO).await.unwrap());
    }

    tokio::time::advance(Duration::from_secs(8)).await;
    // A slow request that comes and goes counts as activity
    drop(slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap());

    let started = Instant::now();
    let borrowed = slots
        .acquire(SlotKind::Fast, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(started.elapsed(), WINDOW);
    assert!(borrowed.is_borrowed());
}

#[tokio::test(start_paused = true)]
async fn test_slow_request_borrows_idle_fast_slot() {
    let slots = ten_slots();
    let _a = slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap();
    let _b = slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap();

    tokio::time::advance(WINDOW).await;
    let third = slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap();
    assert!(third.is_borrowed());
    assert_eq!(slots.status().fast_lent_to_slow, 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_wakes_waiter_in_same_partition() {
    let slots = ten_slots();
    let first = slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap();
    let _second = slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap();
    // Keep the fast partition busy so the waiter cannot borrow
    let mut fast = Vec::new();
    for _ in 0..8 {
        fast.push(slots.acquire(SlotKind::Fast, Duration::ZERO).await.unwrap());
    }

    let waiter = {
        let slots = slots.clone();
        tokio::spawn(async move { slots.acquire(SlotKind::Slow, Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(first);

    let permit = waiter.await.unwrap().unwrap();
    assert!(!permit.is_borrowed());
    assert_eq!(slots.status().active_slow, 2);
}

#[tokio::test]
async fn test_disabled_manager_never_limits() {
    let slots = Arc::new(SlotManager::new(2, 0.5, WINDOW, false));
    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(slots.acquire(SlotKind::Slow, Duration::ZERO).await.unwrap());
    }
    assert!(held.iter().all(|p| !p.is_borrowed()));
    assert!(!slots.is_enabled());
}

#[tokio::test]
async fn test_resize_repartitions_by_fraction() {
    let slots = ten_slots();
    slots.resize(20);
    let status = slots.status();
    assert_eq!(status.total, 20);
    assert_eq!((status.fast_slots, status.slow_slots), (16, 4));

    slots.resize(3);
    let status = slots.status();
    assert_eq!((status.fast_slots, status.slow_slots), (2, 1));
}
