//! Orchestrator — the single consumer of the scheduling queue
//!
//! Every input (graph changes, manual triggers, remediation actions, finished
//! builds, issued facts) enters one ordered queue. The loop decides what runs,
//! build tasks execute concurrently under a global permit limit, and their
//! results come back through the same queue.
//!
//! Per node there is at most one running build and at most one pending entry:
//! a newer generation replaces a pending entry (superseding it) but never
//! pre-empts a running build. When a running build finishes under a newer
//! generation its result is re-validated and either adopted or rebuilt.

use crate::builder::{BuildContext, BuilderRegistry, NodeBuilder};
use crate::journal::BuildJournal;
use crate::live::LiveStates;
use crate::recovery;
use crate::rollback::rollback;
use keystone_bus::{EventBus, IdempotencyGuard, Subscriber};
use keystone_core::config::OrchestratorConfig;
use keystone_core::{
    BuildRecord, BuildStatus, BuildTrigger, BuildUpdate, Error, Event, Fact, Fault, GraphChange,
    Manifest, NodeId, Payload, RemediationAction, RemediationEvent, Result, Snapshot, StateStore,
    Topic, TriggerReason,
};
use keystone_registry::Registry;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Queue input
// ---------------------------------------------------------------------------

enum Input {
    GraphChanged {
        change: GraphChange,
        causal_id: String,
    },
    Trigger {
        trigger: BuildTrigger,
        causal_id: String,
    },
    Remediation {
        event: RemediationEvent,
        causal_id: String,
    },
    BuildFinished(Finished),
    FactIssued(Fact),
    /// A succeeded build has waited the full certification timeout.
    CertificationOverdue {
        node: NodeId,
        build_id: String,
    },
    Shutdown,
}

struct Finished {
    node: NodeId,
    build_id: String,
    attempts: u32,
    outcome: Outcome,
}

enum Outcome {
    Succeeded(Value),
    /// Attempts exhausted; rollback already ran inside the build task.
    Failed {
        error: String,
        rollback: Result<Option<Snapshot>>,
    },
    Cancelled,
}

/// Bus-facing side of the queue. Handlers only enqueue, so critical publishes
/// never wait on scheduling work.
struct Inbox {
    tx: mpsc::UnboundedSender<Input>,
    seen: IdempotencyGuard,
}

#[async_trait::async_trait]
impl Subscriber for Inbox {
    fn name(&self) -> &str {
        "orchestrator"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if !self.seen.first_seen(&event.id) {
            return Ok(());
        }
        let causal_id = event.id.clone();
        let input = match &event.payload {
            Payload::GraphChange(change) => Input::GraphChanged {
                change: change.clone(),
                causal_id,
            },
            Payload::BuildTrigger(trigger) => Input::Trigger {
                trigger: trigger.clone(),
                causal_id,
            },
            Payload::Remediation(remediation) => Input::Remediation {
                event: remediation.clone(),
                causal_id,
            },
            Payload::Fact(fact) => Input::FactIssued(fact.clone()),
            _ => return Ok(()),
        };
        self.tx.send(input).map_err(|_| {
            self.seen.forget(&event.id);
            Error::Internal("orchestrator loop is not running".into())
        })
    }
}

// ---------------------------------------------------------------------------
// Plan: one entry per node, for the latest generation that touched it
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Waiting,
    Running,
    AwaitingFact,
    Certified,
    Failed,
    Blocked,
}

impl Stage {
    fn in_progress(self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::AwaitingFact)
    }
}

struct Planned {
    generation: u64,
    /// Build standing for this entry: its own pending build, or an adopted one.
    build_id: String,
    causal_id: String,
    stage: Stage,
    /// A dependency is rebuilt in the same generation.
    deps_affected: bool,
}

struct Inflight {
    build_id: String,
    causal_id: String,
}

struct BuildTask {
    manifest: Arc<Manifest>,
    build_id: String,
    generation: u64,
    dependencies: BTreeMap<NodeId, Value>,
    builder: Arc<dyn NodeBuilder>,
}

// ---------------------------------------------------------------------------
// Orchestrator handle
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    tx: mpsc::UnboundedSender<Input>,
    journal: Arc<BuildJournal>,
    live: Arc<LiveStates>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Recover unfinished builds, subscribe to the bus and start the loop.
    pub async fn start(
        config: OrchestratorConfig,
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        store: Arc<dyn StateStore>,
        builders: BuilderRegistry,
    ) -> Result<Self> {
        let journal = Arc::new(BuildJournal::load(store.clone()).await?);
        let live = Arc::new(LiveStates::load(store.as_ref()).await?);
        let recovered =
            recovery::recover(&journal, &live, store.as_ref(), &bus, config.rollback_budget())
                .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Arc::new(Inbox {
            tx: tx.clone(),
            seen: IdempotencyGuard::new(4096),
        });
        for topic in [
            Topic::GraphChange,
            Topic::BuildTrigger,
            Topic::Remediation,
            Topic::Fact,
        ] {
            bus.subscribe(topic, inbox.clone()).await;
        }

        let generation = journal
            .all()
            .iter()
            .map(|r| r.generation)
            .max()
            .unwrap_or(0);
        let cancel = CancellationToken::new();

        let scheduler = OrchestratorLoop {
            rx,
            tx: tx.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_builds.max(1))),
            config,
            registry,
            bus,
            store,
            builders: Arc::new(builders),
            journal: journal.clone(),
            live: live.clone(),
            cancel: cancel.clone(),
            plan: BTreeMap::new(),
            running: HashMap::new(),
            awaiting: HashMap::new(),
            deferred: HashMap::new(),
            generation,
        };
        let handle = tokio::spawn(scheduler.run());
        info!(recovered, generation, "orchestrator started");

        Ok(Self {
            tx,
            journal,
            live,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn journal(&self) -> &Arc<BuildJournal> {
        &self.journal
    }

    pub fn live(&self) -> &Arc<LiveStates> {
        &self.live
    }

    /// Stop the loop and cancel running builds. Unfinished builds are left
    /// non-terminal in the journal and recovered on the next start.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Input::Shutdown);
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

struct OrchestratorLoop {
    rx: mpsc::UnboundedReceiver<Input>,
    /// Build tasks report back through this.
    tx: mpsc::UnboundedSender<Input>,
    config: OrchestratorConfig,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    builders: Arc<BuilderRegistry>,
    journal: Arc<BuildJournal>,
    live: Arc<LiveStates>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    plan: BTreeMap<NodeId, Planned>,
    running: HashMap<NodeId, Inflight>,
    /// Succeeded builds waiting for their fact, by build id.
    awaiting: HashMap<String, Snapshot>,
    /// Remediations that arrived while their node still awaited a fact.
    deferred: HashMap<NodeId, Vec<(RemediationEvent, String)>>,
    generation: u64,
}

impl OrchestratorLoop {
    async fn run(mut self) {
        info!("orchestrator loop started");
        while let Some(input) = self.rx.recv().await {
            match input {
                Input::GraphChanged { change, causal_id } => {
                    self.on_graph_change(change, causal_id).await
                }
                Input::Trigger { trigger, causal_id } => {
                    self.start_generation(
                        vec![trigger.node_id],
                        trigger.trigger_id,
                        trigger.reason,
                        causal_id,
                    )
                    .await
                }
                Input::Remediation { event, causal_id } => {
                    self.on_remediation(event, causal_id).await
                }
                Input::BuildFinished(finished) => self.on_finished(finished).await,
                Input::FactIssued(fact) => self.on_fact(fact).await,
                Input::CertificationOverdue { node, build_id } => {
                    self.on_certification_overdue(node, build_id).await
                }
                Input::Shutdown => {
                    info!(running = self.running.len(), "orchestrator received shutdown");
                    self.cancel.cancel();
                    break;
                }
            }
        }
        info!("orchestrator loop stopped");
    }

    async fn on_graph_change(&mut self, change: GraphChange, causal_id: String) {
        for id in &change.removed {
            if let Some(entry) = self.plan.remove(id) {
                if entry.stage == Stage::Waiting {
                    self.finish_record(
                        &entry.build_id,
                        BuildStatus::Superseded,
                        Some("node removed".into()),
                        &entry.causal_id,
                    )
                    .await;
                }
            }
            self.deferred.remove(id);
            if !self.running.contains_key(id) {
                self.forget_node(id).await;
            }
        }

        let changed: Vec<NodeId> = change.changed().cloned().collect();
        if changed.is_empty() {
            return;
        }
        self.start_generation(
            changed,
            format!("graph-v{}", change.graph_version),
            TriggerReason::GraphChange,
            causal_id,
        )
        .await;
    }

    /// Open a new trigger generation over the changed nodes and everything
    /// depending on them, then schedule whatever is ready.
    async fn start_generation(
        &mut self,
        changed: Vec<NodeId>,
        trigger_id: String,
        reason: TriggerReason,
        causal_id: String,
    ) {
        let snapshot = self.registry.snapshot();
        let mut affected = BTreeSet::new();
        for id in changed {
            match snapshot.dependents_of(&id) {
                Ok(dependents) => {
                    affected.insert(id);
                    affected.extend(dependents);
                }
                Err(e) => warn!(node = %id, error = %e, "trigger for unknown node ignored"),
            }
        }
        if affected.is_empty() {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let mut order: Vec<NodeId> = affected.iter().cloned().collect();
        snapshot.graph().sort_by_depth(&mut order);
        info!(generation, %trigger_id, %reason, nodes = order.len(), "generation started");

        for node in order {
            let Some(manifest) = snapshot.get(&node) else {
                continue;
            };
            let replaced = self
                .plan
                .get(&node)
                .filter(|p| p.stage == Stage::Waiting)
                .map(|p| (p.build_id.clone(), p.causal_id.clone()));
            if let Some((build_id, prior_causal)) = replaced {
                self.finish_record(
                    &build_id,
                    BuildStatus::Superseded,
                    Some(format!("superseded by generation {}", generation)),
                    &prior_causal,
                )
                .await;
            }

            let record = BuildRecord::new(&node, &trigger_id, generation, reason, manifest.version);
            self.commit(&record, None, &causal_id).await;
            let deps_affected = manifest.dependencies.iter().any(|d| affected.contains(d));
            self.plan.insert(
                node,
                Planned {
                    generation,
                    build_id: record.build_id,
                    causal_id: causal_id.clone(),
                    stage: Stage::Waiting,
                    deps_affected,
                },
            );
        }

        self.schedule().await;
    }

    /// Start every waiting build whose slot is free and whose dependencies have settled.
    async fn schedule(&mut self) {
        let snapshot = self.registry.snapshot();
        let mut waiting: Vec<NodeId> = self
            .plan
            .iter()
            .filter(|(_, p)| p.stage == Stage::Waiting)
            .map(|(id, _)| id.clone())
            .collect();
        snapshot.graph().sort_by_depth(&mut waiting);

        for node in waiting {
            if self.running.contains_key(&node) {
                continue;
            }
            let Some(manifest) = snapshot.get(&node).cloned() else {
                continue;
            };
            let ready = manifest.dependencies.iter().all(|d| {
                !self.running.contains_key(d)
                    && self.plan.get(d).map_or(true, |p| !p.stage.in_progress())
            });
            if !ready {
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!(node = %node, "build slots exhausted, deferring");
                break;
            };
            self.start_build(manifest, permit).await;
        }
    }

    async fn start_build(&mut self, manifest: Arc<Manifest>, permit: OwnedSemaphorePermit) {
        let node = manifest.id.clone();
        let Some(entry) = self.plan.get_mut(&node) else {
            return;
        };
        entry.stage = Stage::Running;
        let (build_id, causal_id, generation) =
            (entry.build_id.clone(), entry.causal_id.clone(), entry.generation);

        let Some(mut record) = self.journal.get(&build_id) else {
            error!(node = %node, build_id, "pending build missing from journal");
            return;
        };
        record.status = BuildStatus::Running;
        record.started_at = chrono::Utc::now();
        self.commit(&record, None, &causal_id).await;
        self.running.insert(
            node.clone(),
            Inflight {
                build_id: build_id.clone(),
                causal_id,
            },
        );

        let dependencies = manifest
            .dependencies
            .iter()
            .filter_map(|d| self.live.current(d).map(|s| (d.clone(), s.state)))
            .collect();
        info!(node = %node, generation, build_id, "build started");

        let task = BuildTask {
            builder: self.builders.for_node(&node),
            manifest,
            build_id,
            generation,
            dependencies,
        };
        tokio::spawn(run_build(
            task,
            permit,
            self.config.clone(),
            self.store.clone(),
            self.live.clone(),
            self.tx.clone(),
            self.cancel.child_token(),
        ));
    }

    async fn on_finished(&mut self, finished: Finished) {
        let Finished {
            node,
            build_id,
            attempts,
            outcome,
        } = finished;
        let causal_id = match self.running.remove(&node) {
            Some(inflight) if inflight.build_id == build_id => inflight.causal_id,
            Some(other) => {
                // Cannot happen while the slot is respected; keep the real one.
                self.running.insert(node.clone(), other);
                build_id.clone()
            }
            None => build_id.clone(),
        };
        let Some(mut record) = self.journal.get(&build_id) else {
            return;
        };
        record.attempt_count = attempts;
        let current = self
            .plan
            .get(&node)
            .map_or(false, |p| p.build_id == build_id);

        match outcome {
            Outcome::Succeeded(_) if self.registry.snapshot().get(&node).is_none() => {
                info!(node = %node, build_id, "build finished after node removal, discarded");
                record.finish(BuildStatus::Superseded, Some("node removed".into()));
                self.commit(&record, None, &causal_id).await;
                self.forget_node(&node).await;
            }
            Outcome::Succeeded(state) => {
                let snapshot =
                    Snapshot::new(&node, &build_id, record.manifest_version, state.clone());
                if let Err(e) = self.store.put_live(&node, Some(&snapshot)).await {
                    error!(node = %node, build_id, error = %e, "live pointer persistence failed");
                }
                self.live.swap(&node, Some(snapshot.clone()));
                self.awaiting.insert(build_id.clone(), snapshot);

                record.finish(BuildStatus::Succeeded, None);
                info!(node = %node, build_id, attempts, wall_ms = record.wall_ms().unwrap_or(0), "build succeeded");
                let delivered = self.try_commit(&record, Some(state), &causal_id).await;

                if current {
                    if let Some(entry) = self.plan.get_mut(&node) {
                        entry.stage = Stage::AwaitingFact;
                    }
                } else if delivered.is_ok() {
                    self.revalidate(&node, &record).await;
                }
                match delivered {
                    Ok(()) => self.watch_certification(&node, &build_id),
                    // Without the certifier's ack no fact is coming.
                    Err(e) => self.settle_uncertified(&node, &build_id, e).await,
                }
            }
            Outcome::Failed { error, rollback } => {
                warn!(node = %node, build_id, attempts, error = %error, "build failed, attempts exhausted");
                record.finish(BuildStatus::Failed, Some(error.clone()));
                self.commit(&record, None, &causal_id).await;
                match rollback {
                    Ok(_) => {
                        record.finish(BuildStatus::RolledBack, Some(error));
                        self.commit(&record, None, &causal_id).await;
                    }
                    Err(e) => self.fault(&node, &e, &causal_id).await,
                }
                if current {
                    if let Some(entry) = self.plan.get_mut(&node) {
                        entry.stage = Stage::Failed;
                    }
                    self.block_dependents(&node).await;
                }
            }
            Outcome::Cancelled => {
                debug!(node = %node, build_id, "build cancelled");
                return;
            }
        }

        self.schedule().await;
    }

    /// A build finished after a newer generation queued the node again. Adopt
    /// its result when the manifest is unchanged and no dependency is being rebuilt.
    async fn revalidate(&mut self, node: &NodeId, finished: &BuildRecord) {
        let current_version = self.registry.snapshot().get(node).map(|m| m.version);
        let Some(entry) = self.plan.get_mut(node) else {
            return;
        };
        if entry.stage != Stage::Waiting {
            return;
        }
        if current_version != Some(finished.manifest_version) || entry.deps_affected {
            debug!(node = %node, generation = entry.generation, "finished build is stale, rebuilding");
            return;
        }

        let pending = std::mem::replace(&mut entry.build_id, finished.build_id.clone());
        entry.stage = Stage::AwaitingFact;
        let causal_id = entry.causal_id.clone();
        info!(node = %node, generation = entry.generation, build_id = %finished.build_id, "finished build adopted by newer generation");
        self.finish_record(
            &pending,
            BuildStatus::Superseded,
            Some(format!("satisfied by build {}", finished.build_id)),
            &causal_id,
        )
        .await;
    }

    async fn on_fact(&mut self, fact: Fact) {
        if let Some(snapshot) = self.awaiting.remove(&fact.build_id) {
            if fact.is_certified() {
                if let Err(e) = self.store.put_snapshot(&snapshot).await {
                    error!(node = %fact.node_id, error = %e, "last known good persistence failed");
                }
                self.live.set_last_known_good(snapshot);
            }
        }

        let settled = match self.plan.get_mut(&fact.node_id) {
            Some(entry) if entry.build_id == fact.build_id && entry.stage == Stage::AwaitingFact => {
                entry.stage = if fact.is_certified() {
                    Stage::Certified
                } else {
                    Stage::Failed
                };
                Some(entry.stage)
            }
            _ => None,
        };
        match settled {
            Some(Stage::Certified) => {
                debug!(node = %fact.node_id, build_id = %fact.build_id, "node certified")
            }
            Some(_) => {
                warn!(node = %fact.node_id, build_id = %fact.build_id, failed = ?fact.failed_invariants(), "certification rejected");
                self.block_dependents(&fact.node_id).await;
            }
            None => {}
        }
        self.resume_deferred(&fact.node_id).await;
        self.schedule().await;
    }

    async fn on_certification_overdue(&mut self, node: NodeId, build_id: String) {
        if !self.awaiting.contains_key(&build_id) {
            return;
        }
        let err = Error::delivery_failure(
            Topic::Fact.as_str(),
            "orchestrator",
            format!(
                "no fact for build {} within {}ms",
                build_id, self.config.certification_timeout_ms
            ),
            true,
        );
        self.settle_uncertified(&node, &build_id, err).await;
        self.schedule().await;
    }

    /// Settle a succeeded build whose fact will never arrive as failed, so its
    /// dependents are blocked instead of waiting forever.
    async fn settle_uncertified(&mut self, node: &NodeId, build_id: &str, err: Error) {
        self.awaiting.remove(build_id);
        let causal_id = match self.plan.get_mut(node) {
            Some(entry) if entry.build_id == build_id && entry.stage == Stage::AwaitingFact => {
                entry.stage = Stage::Failed;
                entry.causal_id.clone()
            }
            _ => {
                warn!(node = %node, build_id, error = %err, "superseded build left uncertified");
                return;
            }
        };
        warn!(node = %node, build_id, error = %err, "build not certified, settling as failed");
        self.fault(node, &err, &causal_id).await;
        self.block_dependents(node).await;
        self.resume_deferred(node).await;
    }

    fn watch_certification(&self, node: &NodeId, build_id: &str) {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let wait = self.config.certification_timeout();
        let (node, build_id) = (node.clone(), build_id.to_string());
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let _ = tx.send(Input::CertificationOverdue { node, build_id });
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Replay remediations held for `node` once it no longer awaits a fact.
    async fn resume_deferred(&mut self, node: &NodeId) {
        if self
            .plan
            .get(node)
            .is_some_and(|p| p.stage == Stage::AwaitingFact)
        {
            return;
        }
        let Some(held) = self.deferred.remove(node) else {
            return;
        };
        for (event, causal_id) in held {
            self.on_remediation(event, causal_id).await;
        }
    }

    async fn on_remediation(&mut self, event: RemediationEvent, causal_id: String) {
        let node = event.node_id.clone();
        // The fact that caused this may still be queued behind it; let it settle
        // the current generation first so its dependents are blocked there.
        if self
            .plan
            .get(&node)
            .is_some_and(|p| p.stage == Stage::AwaitingFact)
        {
            debug!(node = %node, rule_id = %event.rule_id, "remediation held until the pending fact settles");
            self.deferred
                .entry(node)
                .or_default()
                .push((event, causal_id));
            return;
        }
        match &event.action {
            RemediationAction::RetryBuild => {
                self.start_generation(
                    vec![node],
                    causal_id.clone(),
                    TriggerReason::Remediation,
                    causal_id,
                )
                .await
            }
            RemediationAction::RollbackNode => {
                if self.running.contains_key(&node) {
                    warn!(node = %node, rule_id = %event.rule_id, "rollback skipped, build in flight");
                    return;
                }
                let started = Instant::now();
                match rollback(
                    self.store.as_ref(),
                    &self.live,
                    &node,
                    self.config.rollback_budget(),
                    started,
                )
                .await
                {
                    Ok(_) => {
                        let latest = self.journal.latest(&node).filter(|r| {
                            matches!(r.status, BuildStatus::Succeeded | BuildStatus::Failed)
                        });
                        if let Some(mut record) = latest {
                            record.finish(
                                BuildStatus::RolledBack,
                                Some(format!("rolled back by guardrail {}", event.rule_id)),
                            );
                            self.commit(&record, None, &causal_id).await;
                        }
                    }
                    Err(e) => self.fault(&node, &e, &causal_id).await,
                }
            }
            RemediationAction::Escalate { reason } => {
                warn!(
                    node = %node,
                    rule_id = %event.rule_id,
                    attempt = event.attempt_number,
                    reason = %reason,
                    "escalated to operator"
                );
            }
        }
    }

    /// Mark every not-yet-started transitive dependent of `node` as blocked.
    async fn block_dependents(&mut self, node: &NodeId) {
        let dependents = self
            .registry
            .snapshot()
            .dependents_of(node)
            .unwrap_or_default();
        for dependent in dependents {
            let Some(entry) = self.plan.get_mut(&dependent) else {
                continue;
            };
            if entry.stage != Stage::Waiting {
                continue;
            }
            entry.stage = Stage::Blocked;
            let (build_id, causal_id) = (entry.build_id.clone(), entry.causal_id.clone());
            warn!(node = %dependent, blocked_by = %node, build_id, "build blocked");
            self.finish_record(
                &build_id,
                BuildStatus::Blocked,
                Some(format!("dependency {} did not settle successfully", node)),
                &causal_id,
            )
            .await;
        }
    }

    async fn finish_record(
        &self,
        build_id: &str,
        status: BuildStatus,
        error: Option<String>,
        causal_id: &str,
    ) {
        if let Some(mut record) = self.journal.get(build_id) {
            record.finish(status, error);
            self.commit(&record, None, causal_id).await;
        }
    }

    /// Journal a record transition and announce it. The journal is authoritative;
    /// delivery failures are logged, not fatal to scheduling.
    async fn commit(&self, record: &BuildRecord, state: Option<Value>, causal_id: &str) {
        if let Err(e) = self.try_commit(record, state, causal_id).await {
            warn!(node = %record.node_id, build_id = %record.build_id, status = %record.status, error = %e, "build status delivery failed");
        }
    }

    /// Like [`commit`](Self::commit), but hands the delivery failure back.
    async fn try_commit(
        &self,
        record: &BuildRecord,
        state: Option<Value>,
        causal_id: &str,
    ) -> Result<()> {
        if let Err(e) = self.journal.record(record).await {
            error!(build_id = %record.build_id, error = %e, "build journal write failed");
        }
        let event = Event::new(
            Payload::BuildStatus(BuildUpdate {
                record: record.clone(),
                state,
            }),
            causal_id,
        );
        self.bus.publish(event).await.map(|_| ())
    }

    /// Drop a removed node's live pointer and last-known-good, in memory and on disk.
    async fn forget_node(&self, node: &NodeId) {
        if let Err(e) = self.store.put_live(node, None).await {
            warn!(node = %node, error = %e, "live pointer removal failed");
        }
        if let Err(e) = self.store.remove_snapshot(node).await {
            warn!(node = %node, error = %e, "snapshot removal failed");
        }
        self.live.forget(node);
    }

    async fn fault(&self, node: &NodeId, err: &Error, causal_id: &str) {
        error!(node = %node, kind = ?err.kind(), error = %err, "orchestration fault");
        publish_fault(&self.bus, node, err, causal_id).await;
    }
}

pub(crate) async fn publish_fault(bus: &EventBus, node: &NodeId, err: &Error, causal_id: &str) {
    let event = Event::new(
        Payload::Fault(Fault {
            node_id: node.clone(),
            kind: err.kind(),
            message: err.to_string(),
        }),
        causal_id,
    );
    if let Err(e) = bus.publish(event).await {
        warn!(node = %node, error = %e, "fault delivery failed");
    }
}

// ---------------------------------------------------------------------------
// Build task
// ---------------------------------------------------------------------------

/// Execute one build with retries. On exhaustion the rollback runs here, right
/// at failure detection, so the budget is not spent waiting in the queue.
async fn run_build(
    task: BuildTask,
    permit: OwnedSemaphorePermit,
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    live: Arc<LiveStates>,
    tx: mpsc::UnboundedSender<Input>,
    cancel: CancellationToken,
) {
    let node = task.manifest.id.clone();
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    let outcome = loop {
        attempt += 1;
        let ctx = BuildContext {
            build_id: task.build_id.clone(),
            generation: task.generation,
            attempt,
            dependencies: task.dependencies.clone(),
            cancel: cancel.clone(),
        };
        let result = match tokio::time::timeout(
            config.build_timeout(),
            task.builder.build_cancellable(&task.manifest, &ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::build_failure(
                &node,
                attempt,
                format!("timed out after {}ms", config.build_timeout_ms),
            )),
        };

        match result {
            Ok(state) => break Outcome::Succeeded(state),
            Err(_) if cancel.is_cancelled() => break Outcome::Cancelled,
            Err(e) if attempt >= max_attempts || !e.is_recoverable() => {
                let detected_at = Instant::now();
                let rollback = rollback(
                    store.as_ref(),
                    &live,
                    &node,
                    config.rollback_budget(),
                    detected_at,
                )
                .await;
                break Outcome::Failed {
                    error: e.to_string(),
                    rollback,
                };
            }
            Err(e) => {
                let backoff: Duration = config.backoff(attempt);
                warn!(
                    node = %node,
                    build_id = %task.build_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "build attempt failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break Outcome::Cancelled,
                }
            }
        }
    };

    // Release the slot before reporting so the loop can reuse it immediately.
    drop(permit);
    let _ = tx.send(Input::BuildFinished(Finished {
        node,
        build_id: task.build_id,
        attempts: attempt,
        outcome,
    }));
}
