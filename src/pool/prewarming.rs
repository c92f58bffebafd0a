//! Minimum-idle top-up
//!
//! Connections are created concurrently by checking out enough objects to
//! force creation, then all returned to the pool together.

use deadpool::managed;
use std::time::Duration;
use tracing::{debug, warn};

use super::deadpool_connection::BackendManager;

/// Wait budget for each object checked out during top-up
const TOP_UP_WAIT: Duration = Duration::from_millis(500);

/// Bring the idle count up to `min_idle` without exceeding the pool maximum
///
/// Returns the number of connections created.
pub async fn top_up_idle(pool: &managed::Pool<BackendManager>, name: &str, min_idle: usize) -> usize {
    let status = pool.status();
    if status.available >= min_idle {
        return 0;
    }
    let in_use = status.size.saturating_sub(status.available);
    let wanted = min_idle.min(status.max_size.saturating_sub(in_use));
    let missing = wanted.saturating_sub(status.available);
    if missing == 0 {
        return 0;
    }

    debug!(target_name = %name, wanted, existing = status.available, "Topping up idle connections");

    let checkouts = (0..wanted).map(|_| tokio::time::timeout(TOP_UP_WAIT, pool.get()));
    let results = futures::future::join_all(checkouts).await;

    let mut held = Vec::with_capacity(wanted);
    let mut failures = 0usize;
    for result in results {
        match result {
            Ok(Ok(obj)) => held.push(obj),
            Ok(Err(e)) => {
                failures += 1;
                debug!(target_name = %name, error = %e, "Top-up connection failed");
            }
            Err(_) => failures += 1,
        }
    }

    let after = pool.status().size;
    drop(held);
    let created = after.saturating_sub(status.size);

    if failures > 0 {
        warn!(
            target_name = %name,
            created,
            failures,
            "Could not reach minimum idle connections"
        );
    }
    created
}
