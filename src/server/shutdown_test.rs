use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_signal_starts_unset() {
    let (_controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());
}

#[tokio::test]
async fn test_shutdown_propagates_to_signal() {
    let (controller, signal) = shutdown_channel();
    controller.shutdown();
    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_wait_returns_after_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    let waiter = tokio::spawn(async move {
        signal.wait().await;
        true
    });

    controller.shutdown();
    let finished = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait() should return promptly after shutdown")
        .expect("waiter task should not panic");
    assert!(finished);
}

#[tokio::test]
async fn test_wait_returns_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    tokio::time::timeout(Duration::from_secs(1), signal.wait())
        .await
        .expect("wait() should return when the sender is dropped");
}

#[tokio::test]
async fn test_cloned_signals_all_observe_shutdown() {
    let (controller, signal) = shutdown_channel();
    let mut a = signal.clone();
    let mut b = signal;

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(1), a.wait())
        .await
        .expect("first clone observes shutdown");
    tokio::time::timeout(Duration::from_secs(1), b.wait())
        .await
        .expect("second clone observes shutdown");
}
