//! Bounded-time rollback to the last-known-good snapshot.

use crate::live::LiveStates;
use keystone_core::{Error, NodeId, Result, Snapshot, StateStore};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Swap the node's live pointer back to its last-known-good snapshot.
///
/// `detected_at` is when the failure was detected; the persisted swap must
/// complete within `budget` of it. On timeout the in-memory pointer is left
/// untouched and `RollbackTimeout` is returned. A node that never certified
/// rolls back to no state at all.
pub async fn rollback(
    store: &dyn StateStore,
    live: &LiveStates,
    node: &NodeId,
    budget: Duration,
    detected_at: Instant,
) -> Result<Option<Snapshot>> {
    let target = live.last_known_good(node);
    let remaining = budget.saturating_sub(detected_at.elapsed());

    match tokio::time::timeout(remaining, store.put_live(node, target.as_ref())).await {
        Ok(Ok(())) => {
            live.swap(node, target.clone());
            info!(
                node = %node,
                build_id = target.as_ref().map(|s| s.build_id.as_str()).unwrap_or("-"),
                elapsed_ms = detected_at.elapsed().as_millis() as u64,
                "rolled back to last known good"
            );
            Ok(target)
        }
        Ok(Err(e)) => {
            error!(node = %node, error = %e, "rollback persistence failed");
            Err(e)
        }
        Err(_) => {
            let elapsed_ms = detected_at.elapsed().as_millis() as u64;
            error!(node = %node, elapsed_ms, budget_ms = budget.as_millis() as u64, "rollback exceeded budget");
            Err(Error::RollbackTimeout {
                node: node.clone(),
                elapsed_ms,
                budget_ms: budget.as_millis() as u64,
            })
        }
    }
}
