//! Rotation state machine
//!
//! `CheckDue -> Generate -> Distribute -> Verify -> RecordExternally ->
//! RevokeOld -> Done`, shared by every credential class.
//!
//! Distribution is additive: until Verify passes, every node still accepts
//! the previous material. A failure before any node took the new material
//! aborts cleanly. A failure after some nodes took it leaves a partial
//! rotation, tracked in the local journal and refused by later rotations
//! until [`Rotator::reconcile`] rolls it forward.

use super::journal::{JournalPhase, JournalStore, RotationJournal};
use super::kind::{Baseline, CredentialKind, DistributionOrder};
use super::material::{CredentialClass, RotationPolicy};
use crate::error::{KeelError, Result};
use crate::registry::{Node, NodeRegistry};
use crate::remote::{retry_if, RetryPolicy};
use crate::store::{publish_best_effort, ConfigStore, MirrorRecord, SecretMirror, StoreValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPhase {
    CheckDue,
    Generate,
    Distribute,
    Verify,
    RecordExternally,
    RevokeOld,
    Done,
}

impl std::fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RotationPhase::CheckDue => "check-due",
            RotationPhase::Generate => "generate",
            RotationPhase::Distribute => "distribute",
            RotationPhase::Verify => "verify",
            RotationPhase::RecordExternally => "record-externally",
            RotationPhase::RevokeOld => "revoke-old",
            RotationPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why a rotation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic run; rotates only when due and auto-rotation is on
    Scheduled,
    /// Operator request; rotates when due, or any time auto-rotation is off
    Manual,
    /// Rotate regardless of the policy
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RotationOutcome {
    Skipped {
        next_rotation: Option<DateTime<Utc>>,
        remaining_days: i64,
    },
    Rotated {
        rotation_id: String,
        fingerprint: String,
        rotated_at: DateTime<Utc>,
        next_rotation: Option<DateTime<Utc>>,
        mirrored: bool,
        /// Nodes whose old material could not be retired
        revoke_failures: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ReconcileOutcome {
    /// Every node holds the recorded material
    Consistent,
    /// An interrupted rotation was finished
    RolledForward { outcome: RotationOutcome },
    /// Nodes were brought back to the recorded material
    Restored { nodes: Vec<String> },
}

/// Rotation status for one credential class
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStatus {
    pub class: CredentialClass,
    pub fingerprint: Option<String>,
    pub last_rotation: Option<DateTime<Utc>>,
    pub next_rotation: Option<DateTime<Utc>>,
    pub days_until_due: i64,
    pub interval_days: u32,
    pub auto_rotation: bool,
    pub due: bool,
    pub pending_partial: bool,
    pub journal_phase: Option<JournalPhase>,
}

impl RotationStatus {
    /// Recorded and not stuck mid-rotation
    pub fn is_healthy(&self) -> bool {
        !self.pending_partial && self.fingerprint.is_some()
    }
}

/// Called at every phase change, and per node while nodes change
pub type PhaseObserver = Arc<dyn Fn(RotationPhase, Option<&str>) + Send + Sync>;

/// Runs rotations of one credential class
pub struct Rotator {
    kind: Arc<dyn CredentialKind>,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn ConfigStore>,
    journal: JournalStore,
    mirror: Option<Arc<dyn SecretMirror>>,
    mirror_item: String,
    default_interval: u32,
    default_auto: bool,
    record_retry: RetryPolicy,
    cancel: CancellationToken,
    observer: Option<PhaseObserver>,
}

impl Rotator {
    pub fn new(
        kind: Arc<dyn CredentialKind>,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn ConfigStore>,
        journal: JournalStore,
    ) -> Self {
        let default_interval = match kind.class() {
            CredentialClass::SshKey => 90,
            CredentialClass::JoinToken => 30,
        };
        Self {
            kind,
            registry,
            store,
            journal,
            mirror: None,
            mirror_item: String::new(),
            default_interval,
            default_auto: true,
            record_retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    /// Policy used when the store has none recorded
    pub fn with_defaults(mut self, interval_days: u32, auto_rotation: bool) -> Self {
        self.default_interval = interval_days;
        self.default_auto = auto_rotation;
        self
    }

    pub fn with_mirror(mut self, mirror: Option<Arc<dyn SecretMirror>>, item: &str) -> Self {
        self.mirror = mirror;
        self.mirror_item = item.to_string();
        self
    }

    pub fn with_record_retry(mut self, policy: RetryPolicy) -> Self {
        self.record_retry = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: PhaseObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn class(&self) -> CredentialClass {
        self.kind.class()
    }

    fn observe(&self, phase: RotationPhase, node: Option<&str>) {
        if let Some(observer) = &self.observer {
            observer(phase, node);
        }
    }

    fn enter(&self, phase: RotationPhase) {
        tracing::info!("{} rotation: {}", self.class(), phase);
        self.observe(phase, None);
    }

    fn policy(&self) -> Result<RotationPolicy> {
        RotationPolicy::load(self.store.as_ref(), self.class(), self.default_interval, self.default_auto)
    }

    fn target_ids(targets: &[Node]) -> Vec<&str> {
        targets.iter().map(|n| n.id.as_str()).collect()
    }

    /// Rotate if `trigger` and the recorded policy call for it
    pub async fn rotate(&self, trigger: Trigger) -> Result<RotationOutcome> {
        let class = self.class();
        self.enter(RotationPhase::CheckDue);
        self.refuse_unfinished()?;

        let policy = self.policy()?;
        let now = Utc::now();
        let due = policy.is_due(now);
        let proceed = match trigger {
            Trigger::Forced => true,
            Trigger::Manual => due || !policy.auto_rotation_enabled,
            Trigger::Scheduled => due && policy.auto_rotation_enabled,
        };
        if !proceed {
            let remaining = policy.remaining(now);
            tracing::info!(
                "{} rotation not due, {} days remaining",
                class,
                remaining.num_days()
            );
            return Ok(RotationOutcome::Skipped {
                next_rotation: policy.due_at(),
                remaining_days: remaining.num_days(),
            });
        }

        self.ensure_consistent().await?;

        if self.cancel.is_cancelled() {
            return Err(KeelError::Cancelled);
        }
        self.enter(RotationPhase::Generate);
        let previous = self.kind.current_material(self.store.as_ref()).await?;
        let baseline = self.kind.baseline().await?;
        let material = self.kind.generate(policy.interval_days).await?;

        let mut journal = RotationJournal::new(class, material, previous);
        journal.baseline_ready = baseline.ready_nodes;
        self.journal.save(&journal)?;
        tracing::info!(
            "{} rotation {} generated {}",
            class,
            journal.rotation_id,
            journal.material.fingerprint
        );

        self.complete(journal, &policy).await
    }

    /// Finish an interrupted rotation, or bring stray nodes back to the
    /// recorded material
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let class = self.class();

        if let Some(journal) = self.journal.load(class)? {
            tracing::info!(
                "Rolling {} rotation {} forward ({}, {} nodes updated)",
                class,
                journal.rotation_id,
                journal.phase,
                journal.updated_nodes.len()
            );
            let policy = self.policy()?;
            let outcome = self.complete(journal, &policy).await?;
            return Ok(ReconcileOutcome::RolledForward { outcome });
        }

        let Some(recorded) = self.store.get_plain(&class.key("fingerprint"))? else {
            return Ok(ReconcileOutcome::Consistent);
        };
        let material = self
            .kind
            .current_material(self.store.as_ref())
            .await?
            .ok_or_else(|| {
                KeelError::Store(format!("{} is recorded but the material is missing", class.key("fingerprint")))
            })?;

        let targets = self.kind.targets(&self.registry);
        let (stray, _) = self.survey(&targets, &recorded).await?;
        if stray.is_empty() {
            return Ok(ReconcileOutcome::Consistent);
        }

        for node in targets.iter().filter(|n| stray.contains(&n.id)) {
            tracing::warn!("[{}] holds unrecorded {} material, restoring", node.id, class);
            self.kind.restore(node, &material).await?;
        }

        let (still, matching) = self.survey(&targets, &recorded).await?;
        if !still.is_empty() {
            return Err(KeelError::PartialRotationState {
                class: class.to_string(),
                updated: still,
                pending: matching,
            });
        }
        Ok(ReconcileOutcome::Restored { nodes: stray })
    }

    /// Recorded policy, fingerprint and any unfinished rotation
    pub fn status(&self) -> Result<RotationStatus> {
        let class = self.class();
        let policy = self.policy()?;
        let journal = self.journal.load(class)?;
        let now = Utc::now();

        Ok(RotationStatus {
            class,
            fingerprint: self.store.get_plain(&class.key("fingerprint"))?,
            last_rotation: policy.last_rotation,
            next_rotation: policy.due_at(),
            days_until_due: policy.remaining(now).num_days(),
            interval_days: policy.interval_days,
            auto_rotation: policy.auto_rotation_enabled,
            due: policy.is_due(now),
            pending_partial: journal.is_some(),
            journal_phase: journal.map(|j| j.phase),
        })
    }

    fn refuse_unfinished(&self) -> Result<()> {
        let class = self.class();
        let Some(journal) = self.journal.load(class)? else {
            return Ok(());
        };

        Err(match journal.phase {
            JournalPhase::Verified => KeelError::BookkeepingIncomplete {
                class: class.to_string(),
                reason: format!(
                    "rotation {} is live on every node but not recorded; run reconcile",
                    journal.rotation_id
                ),
            },
            JournalPhase::Distributing => {
                let targets = self.kind.targets(&self.registry);
                KeelError::PartialRotationState {
                    class: class.to_string(),
                    pending: journal.pending(Self::target_ids(&targets)),
                    updated: journal.updated_nodes,
                }
            }
        })
    }

    /// Refuse to rotate while any node disagrees with the recorded fingerprint
    async fn ensure_consistent(&self) -> Result<()> {
        let class = self.class();
        let Some(recorded) = self.store.get_plain(&class.key("fingerprint"))? else {
            tracing::debug!("no recorded {} fingerprint, first rotation", class);
            return Ok(());
        };

        let targets = self.kind.targets(&self.registry);
        let (stray, matching) = self.survey(&targets, &recorded).await?;
        if stray.is_empty() {
            return Ok(());
        }
        tracing::error!("{} fingerprint differs from the record on {:?}", class, stray);
        Err(KeelError::PartialRotationState {
            class: class.to_string(),
            updated: stray,
            pending: matching,
        })
    }

    /// Split targets into (differing, matching) against `recorded`
    async fn survey(&self, targets: &[Node], recorded: &str) -> Result<(Vec<String>, Vec<String>)> {
        let current = self.kind.current_material(self.store.as_ref()).await?;
        let mut stray = Vec::new();
        let mut matching = Vec::new();
        for node in targets {
            let fingerprint = self.kind.node_fingerprint(node, current.as_ref()).await?;
            if fingerprint.as_deref() == Some(recorded) {
                matching.push(node.id.clone());
            } else {
                stray.push(node.id.clone());
            }
        }
        Ok((stray, matching))
    }

    async fn complete(&self, mut journal: RotationJournal, policy: &RotationPolicy) -> Result<RotationOutcome> {
        let class = self.class();
        let targets = self.kind.targets(&self.registry);

        if journal.phase == JournalPhase::Distributing {
            self.enter(RotationPhase::Distribute);
            self.distribute(&mut journal, &targets).await?;

            self.enter(RotationPhase::Verify);
            let baseline = Baseline {
                ready_nodes: journal.baseline_ready,
            };
            if let Err(e) = self.kind.verify(&targets, &journal.material, &baseline).await {
                return Err(self.abandon(&journal, &targets, RotationPhase::Verify, e).await);
            }
            journal.mark_verified();
            self.journal.save(&journal)?;
        }

        self.enter(RotationPhase::RecordExternally);
        let rotated_at = Utc::now();
        let next = policy.rotated_at(rotated_at);
        self.record(&journal, &next).await?;
        self.journal.clear(class)?;

        let record = MirrorRecord {
            item: self.mirror_item.clone(),
            class: class.to_string(),
            rotation_id: journal.rotation_id.clone(),
            fingerprint: journal.material.fingerprint.clone(),
            rotated_at,
            next_rotation: next.next_rotation.unwrap_or(rotated_at),
        };
        let mirrored = publish_best_effort(self.mirror.as_deref(), &record).await;

        self.enter(RotationPhase::RevokeOld);
        let mut revoke_failures = Vec::new();
        for node in &targets {
            match self.kind.revoke_old(node, &journal.material).await {
                Ok(()) => self.observe(RotationPhase::RevokeOld, Some(&node.id)),
                Err(e) => {
                    tracing::warn!("[{}] could not retire old {} material: {}", node.id, class, e);
                    revoke_failures.push(node.id.clone());
                }
            }
        }

        self.enter(RotationPhase::Done);
        tracing::info!(
            "{} rotation {} complete, now {}",
            class,
            journal.rotation_id,
            journal.material.fingerprint
        );

        Ok(RotationOutcome::Rotated {
            rotation_id: journal.rotation_id,
            fingerprint: journal.material.fingerprint,
            rotated_at,
            next_rotation: next.next_rotation,
            mirrored,
            revoke_failures,
        })
    }

    async fn distribute(&self, journal: &mut RotationJournal, targets: &[Node]) -> Result<()> {
        let class = self.class();
        let pending: Vec<Node> = targets
            .iter()
            .filter(|n| !journal.is_updated(&n.id))
            .cloned()
            .collect();
        let mut failure: Option<KeelError> = None;

        match self.kind.order() {
            DistributionOrder::Sequential => {
                for node in &pending {
                    if self.cancel.is_cancelled() {
                        failure = Some(KeelError::Cancelled);
                        break;
                    }
                    match self
                        .kind
                        .distribute_to(node, &journal.material, journal.previous.as_ref())
                        .await
                    {
                        Ok(()) => {
                            journal.mark_updated(&node.id);
                            self.journal.save(journal)?;
                            self.observe(RotationPhase::Distribute, Some(&node.id));
                        }
                        Err(e) => {
                            tracing::error!("[{}] {} distribution failed: {}", node.id, class, e);
                            self.undo(node, journal).await;
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
            DistributionOrder::Parallel => {
                if self.cancel.is_cancelled() {
                    failure = Some(KeelError::Cancelled);
                } else {
                    let mut tasks = JoinSet::new();
                    for node in pending {
                        let kind = self.kind.clone();
                        let material = journal.material.clone();
                        let previous = journal.previous.clone();
                        tasks.spawn(async move {
                            let result = kind.distribute_to(&node, &material, previous.as_ref()).await;
                            (node, result)
                        });
                    }

                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok((node, Ok(()))) => {
                                journal.mark_updated(&node.id);
                                self.observe(RotationPhase::Distribute, Some(&node.id));
                            }
                            Ok((node, Err(e))) => {
                                tracing::error!("[{}] {} distribution failed: {}", node.id, class, e);
                                self.undo(&node, journal).await;
                                if failure.is_none() {
                                    failure = Some(e);
                                }
                            }
                            Err(e) => {
                                if failure.is_none() {
                                    failure = Some(KeelError::Internal(format!("distribution task failed: {}", e)));
                                }
                            }
                        }
                    }
                    self.journal.save(journal)?;
                }
            }
        }

        let Some(error) = failure else {
            return Ok(());
        };

        if journal.updated_nodes.is_empty() {
            self.journal.clear(class)?;
            if matches!(error, KeelError::Cancelled) {
                return Err(error);
            }
            return Err(KeelError::RotationAborted {
                class: class.to_string(),
                phase: RotationPhase::Distribute.to_string(),
                reason: error.to_string(),
            });
        }

        let pending = journal.pending(Self::target_ids(targets));
        tracing::error!(
            "{} rotation {} is partial: {} nodes updated, {} pending; run reconcile",
            class,
            journal.rotation_id,
            journal.updated_nodes.len(),
            pending.len()
        );
        Err(KeelError::PartialRotationState {
            class: class.to_string(),
            updated: journal.updated_nodes.clone(),
            pending,
        })
    }

    /// Best-effort removal of half-applied material from a failed node
    async fn undo(&self, node: &Node, journal: &RotationJournal) {
        if let Err(e) = self
            .kind
            .rollback(node, &journal.material, journal.previous.as_ref())
            .await
        {
            tracing::warn!("[{}] could not undo partial {} change: {}", node.id, self.class(), e);
        }
    }

    /// Roll every updated node back after a failed Verify
    async fn abandon(
        &self,
        journal: &RotationJournal,
        targets: &[Node],
        phase: RotationPhase,
        cause: KeelError,
    ) -> KeelError {
        let class = self.class();
        tracing::error!("{} rotation {} failed {}: {}", class, journal.rotation_id, phase, cause);

        let mut stuck = Vec::new();
        for node in targets.iter().filter(|n| journal.is_updated(&n.id)) {
            match self
                .kind
                .rollback(node, &journal.material, journal.previous.as_ref())
                .await
            {
                Ok(()) => self.observe(phase, Some(&node.id)),
                Err(e) => {
                    tracing::error!("[{}] rollback failed: {}", node.id, e);
                    stuck.push(node.id.clone());
                }
            }
        }

        if stuck.is_empty() {
            if let Err(e) = self.journal.clear(class) {
                tracing::warn!("Could not clear {} journal: {}", class, e);
            }
            return KeelError::RotationAborted {
                class: class.to_string(),
                phase: phase.to_string(),
                reason: cause.to_string(),
            };
        }

        let mut remaining = journal.clone();
        remaining.updated_nodes = stuck.clone();
        if let Err(e) = self.journal.save(&remaining) {
            tracing::warn!("Could not update {} journal: {}", class, e);
        }
        KeelError::PartialRotationState {
            class: class.to_string(),
            pending: remaining.pending(Self::target_ids(targets)),
            updated: stuck,
        }
    }

    /// Write the new material and policy; the durability boundary
    async fn record(&self, journal: &RotationJournal, next: &RotationPolicy) -> Result<()> {
        let class = self.class();
        let mut entries = self.kind.secret_entries(&journal.material);
        entries.extend(next.store_entries(class));
        entries.push((
            class.key("fingerprint"),
            StoreValue::plain(journal.material.fingerprint.clone()),
        ));
        entries.push((
            class.key("last_rotation_id"),
            StoreValue::plain(journal.rotation_id.clone()),
        ));

        let label = format!("record {} rotation {}", class, journal.rotation_id);
        retry_if(&self.record_retry, &label, |_| true, || {
            let store = self.store.clone();
            let entries = entries.clone();
            async move { store.set_many(entries) }
        })
        .await
        .map_err(|e| {
            tracing::error!("{} rotation {} is live but unrecorded: {}", class, journal.rotation_id, e);
            KeelError::BookkeepingIncomplete {
                class: class.to_string(),
                reason: format!("{}; run reconcile to retry", e),
            }
        })
    }
}
