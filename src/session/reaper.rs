//! Background task closing leaked sessions

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::SessionManager;

/// Spawn the idle-session reaper
///
/// Every `interval` the task closes sessions idle for at least
/// `idle_timeout`. A zero interval disables reaping.
pub fn spawn_reaper(
    manager: Arc<SessionManager>,
    interval: Duration,
    idle_timeout: Duration,
    shutdown_rx: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        debug!("Session reaping disabled");
        return None;
    }
    Some(tokio::spawn(run_reaper(
        manager,
        interval,
        idle_timeout,
        shutdown_rx,
    )))
}

async fn run_reaper(
    manager: Arc<SessionManager>,
    interval: Duration,
    idle_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(
        interval_secs = interval.as_secs(),
        idle_timeout_secs = idle_timeout.as_secs(),
        "Starting session reaper"
    );
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.recv() => {
                debug!("Shutting down session reaper");
                break;
            }
        }
        manager.reap_idle(idle_timeout).await;
    }
}
