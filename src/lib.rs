//! keystone — self-certifying build orchestration for a dependency graph of nodes
//!
//! A [`Keystone`] assembles the components around one shared event bus:
//!
//! - registry: versioned manifests and the acyclic dependency graph
//! - orchestrator: generation-aware builds in dependency order, retries, rollback
//! - certifier: invariant checks producing signed, hash-linked facts
//! - autonomy: guardrail policies turning facts into bounded remediation events
//!
//! Components never call each other; everything flows through bus topics.

pub mod status;

pub use status::{NodeReport, StatusReport};

use keystone_autonomy::AutonomyController;
use keystone_bus::{EventBus, Recorder};
use keystone_certifier::{Certifier, FactLedger, FactSigner};
use keystone_core::{
    BuildTrigger, Error, Event, FsStore, GraphChange, KeystoneConfig, Manifest, NodeId, Payload,
    Result, StateStore, Topic,
};
use keystone_orchestrator::{BuildJournal, BuilderRegistry, Orchestrator};
use keystone_registry::{Registry, StatusTracker};
use std::sync::Arc;
use tracing::info;

/// A running keystone instance.
pub struct Keystone {
    config: KeystoneConfig,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    certifier: Arc<Certifier>,
    autonomy: Arc<AutonomyController>,
    orchestrator: Orchestrator,
    faults: Arc<Recorder>,
}

impl Keystone {
    /// Open the on-disk store under `config.store.data_dir` and start every component.
    pub async fn open(config: KeystoneConfig, builders: BuilderRegistry) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(FsStore::new(&config.store.data_dir));
        Self::start(config, store, builders).await
    }

    pub async fn start(
        config: KeystoneConfig,
        store: Arc<dyn StateStore>,
        builders: BuilderRegistry,
    ) -> Result<Self> {
        info!(store = %store.location(), "starting keystone");
        let bus = Arc::new(EventBus::new(&config.bus));
        let registry = Arc::new(Registry::open(store.clone(), bus.clone()).await?);

        let signer = Arc::new(FactSigner::load(&config.certifier, &config.store.data_dir).await?);
        let ledger = Arc::new(FactLedger::open(store.clone(), signer).await?);
        let certifier = Arc::new(Certifier::new(
            &config.certifier,
            registry.clone(),
            ledger,
            bus.clone(),
        ));
        let autonomy = Arc::new(AutonomyController::new(
            &config.autonomy,
            registry.clone(),
            bus.clone(),
        ));
        let faults = Arc::new(Recorder::new("faults"));

        // Observers first: orchestrator recovery publishes as soon as it starts.
        let tracker = Arc::new(StatusTracker::new(registry.clone()));
        bus.subscribe(Topic::BuildStatus, tracker.clone()).await;
        bus.subscribe(Topic::Fact, tracker.clone()).await;
        bus.subscribe(Topic::BuildStatus, certifier.clone()).await;
        bus.subscribe(Topic::Fact, autonomy.clone()).await;
        bus.subscribe(Topic::GraphChange, autonomy.clone()).await;
        bus.subscribe(Topic::Fault, faults.clone()).await;

        let orchestrator = Orchestrator::start(
            config.orchestrator.clone(),
            registry.clone(),
            bus.clone(),
            store.clone(),
            builders,
        )
        .await?;
        restore_statuses(&tracker, &registry, orchestrator.journal(), certifier.ledger());

        info!(
            nodes = registry.snapshot().len(),
            graph_version = registry.snapshot().version,
            "keystone ready"
        );
        Ok(Self {
            config,
            store,
            bus,
            registry,
            certifier,
            autonomy,
            orchestrator,
            faults,
        })
    }

    /// Read the persisted status without starting builds or recovery.
    pub async fn inspect(config: &KeystoneConfig) -> Result<StatusReport> {
        let store: Arc<dyn StateStore> = Arc::new(FsStore::new(&config.store.data_dir));
        let bus = Arc::new(EventBus::new(&config.bus));
        let registry = Arc::new(Registry::open(store.clone(), bus.clone()).await?);
        let journal = BuildJournal::load(store.clone()).await?;
        let signer = Arc::new(FactSigner::load(&config.certifier, &config.store.data_dir).await?);
        let ledger = FactLedger::open(store, signer).await?;

        let tracker = StatusTracker::new(registry.clone());
        restore_statuses(&tracker, &registry, &journal, &ledger);
        let report = StatusReport::collect(&registry, &journal, &ledger);
        bus.shutdown();
        Ok(report)
    }

    pub fn config(&self) -> &KeystoneConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<FactLedger> {
        self.certifier.ledger()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn autonomy(&self) -> &Arc<AutonomyController> {
        &self.autonomy
    }

    /// Orchestration faults observed since start.
    pub fn faults(&self) -> &Arc<Recorder> {
        &self.faults
    }

    pub async fn register(&self, manifest: Manifest) -> Result<GraphChange> {
        self.registry.register(manifest).await
    }

    pub async fn register_all(&self, manifests: Vec<Manifest>) -> Result<GraphChange> {
        self.registry.register_all(manifests).await
    }

    pub async fn remove(&self, id: &NodeId) -> Result<GraphChange> {
        self.registry.remove(id).await
    }

    /// Request a manual rebuild of `node` and its dependents.
    pub async fn trigger(&self, node: &NodeId) -> Result<Event> {
        if self.registry.snapshot().get(node).is_none() {
            return Err(Error::NotFound(node.clone()));
        }
        let trigger = BuildTrigger::manual(node.clone());
        let causal_id = format!("manual:{}", trigger.trigger_id);
        self.bus
            .publish(Event::new(Payload::BuildTrigger(trigger), causal_id))
            .await
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::collect(
            &self.registry,
            self.orchestrator.journal(),
            self.certifier.ledger(),
        )
    }

    pub fn node_status(&self, id: &NodeId) -> Result<NodeReport> {
        NodeReport::collect(&self.registry, self.certifier.ledger(), id)
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.bus.shutdown();
        info!("keystone stopped");
    }
}

fn restore_statuses(
    tracker: &StatusTracker,
    registry: &Registry,
    journal: &BuildJournal,
    ledger: &FactLedger,
) {
    let snapshot = registry.snapshot();
    for manifest in snapshot.manifests() {
        let id = &manifest.id;
        tracker.restore(id, &journal.for_node(id), ledger.last(id).as_ref());
    }
}
