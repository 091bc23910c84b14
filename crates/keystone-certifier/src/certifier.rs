//! Certifier — subscribes to build status and attests every succeeded build.

use crate::ledger::FactLedger;
use crate::predicate::evaluate_invariants;
use keystone_bus::{EventBus, IdempotencyGuard, Subscriber};
use keystone_core::config::CertifierConfig;
use keystone_core::{BuildRecord, BuildStatus, Error, Event, Fact, Payload, Result};
use keystone_registry::Registry;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Certifier {
    registry: Arc<Registry>,
    ledger: Arc<FactLedger>,
    bus: Arc<EventBus>,
    ttl: Option<chrono::Duration>,
    seen: IdempotencyGuard,
}

impl Certifier {
    pub fn new(
        config: &CertifierConfig,
        registry: Arc<Registry>,
        ledger: Arc<FactLedger>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            ledger,
            bus,
            ttl: config
                .fact_ttl_secs
                .map(|s| chrono::Duration::seconds(s as i64)),
            seen: IdempotencyGuard::new(4096),
        }
    }

    pub fn ledger(&self) -> &Arc<FactLedger> {
        &self.ledger
    }

    /// Evaluate the node's declared invariants against the build's state and
    /// append the signed outcome. Never touches node state.
    pub async fn certify(&self, record: &BuildRecord, state: &Value) -> Result<Fact> {
        let manifest = self
            .registry
            .snapshot()
            .get(&record.node_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(record.node_id.clone()))?;
        let results = evaluate_invariants(&manifest.invariants, state);
        let issued_at = chrono::Utc::now();
        let expires_at = self.ttl.map(|ttl| issued_at + ttl);

        let fact = self
            .ledger
            .issue(&record.node_id, &record.build_id, results, issued_at, expires_at)
            .await?;

        if fact.is_certified() {
            info!(node = %fact.node_id, build_id = %fact.build_id, hash = %fact.hash, "fact certified");
        } else {
            let rejection = Error::CertificationRejection {
                node: fact.node_id.clone(),
                build_id: fact.build_id.clone(),
                failed: fact.failed_invariants(),
            };
            warn!(error = %rejection, "fact rejected");
        }
        Ok(fact)
    }
}

#[async_trait::async_trait]
impl Subscriber for Certifier {
    fn name(&self) -> &str {
        "certifier"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let Payload::BuildStatus(update) = &event.payload else {
            return Ok(());
        };
        let record = &update.record;
        if record.status != BuildStatus::Succeeded {
            return Ok(());
        }
        if !self.seen.first_seen(&record.build_id)
            || self.ledger.contains_build(&record.node_id, &record.build_id)
        {
            debug!(build_id = %record.build_id, "build already certified");
            return Ok(());
        }

        let state = update.state.clone().unwrap_or(Value::Null);
        let fact = match self.certify(record, &state).await {
            Ok(fact) => fact,
            Err(e) => {
                self.seen.forget(&record.build_id);
                return Err(e);
            }
        };
        self.bus
            .publish(Event::new(Payload::Fact(fact), event.id.clone()))
            .await?;
        Ok(())
    }
}
