//! Startup recovery of builds interrupted by a restart.

use crate::journal::BuildJournal;
use crate::live::LiveStates;
use crate::orchestrator::publish_fault;
use crate::rollback::rollback;
use keystone_bus::EventBus;
use keystone_core::{BuildStatus, BuildUpdate, Error, Event, Payload, Result, StateStore};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const INTERRUPTED: &str = "interrupted by restart";

/// Settle every journaled build that has no terminal status.
///
/// A build that was running is treated as failed and its node rolled back to
/// the last-known-good snapshot. A build that never started is superseded.
/// Returns the number of builds settled.
pub async fn recover(
    journal: &BuildJournal,
    live: &LiveStates,
    store: &dyn StateStore,
    bus: &EventBus,
    budget: Duration,
) -> Result<usize> {
    let unfinished = journal.unfinished();
    for mut record in unfinished.iter().cloned() {
        let causal_id = format!("recovery:{}", record.build_id);
        if record.status == BuildStatus::Pending {
            record.finish(BuildStatus::Superseded, Some("never started before restart".into()));
            journal.record(&record).await?;
            announce(bus, &record).await;
            continue;
        }

        warn!(node = %record.node_id, build_id = %record.build_id, "recovering interrupted build");
        record.finish(BuildStatus::Failed, Some(INTERRUPTED.into()));
        journal.record(&record).await?;
        announce(bus, &record).await;

        let node = record.node_id.clone();
        match rollback(store, live, &node, budget, Instant::now()).await {
            Ok(_) => {
                record.finish(BuildStatus::RolledBack, Some(INTERRUPTED.into()));
                journal.record(&record).await?;
                announce(bus, &record).await;
                let fault = Error::build_failure(&node, record.attempt_count, INTERRUPTED);
                publish_fault(bus, &node, &fault, &causal_id).await;
            }
            Err(e) => publish_fault(bus, &node, &e, &causal_id).await,
        }
    }
    if !unfinished.is_empty() {
        info!(count = unfinished.len(), "interrupted builds recovered");
    }
    Ok(unfinished.len())
}

async fn announce(bus: &EventBus, record: &keystone_core::BuildRecord) {
    let event = Event::new(
        Payload::BuildStatus(BuildUpdate {
            record: record.clone(),
            state: None,
        }),
        format!("recovery:{}", record.build_id),
    );
    if let Err(e) = bus.publish(event).await {
        warn!(build_id = %record.build_id, error = %e, "recovery status delivery failed");
    }
}
