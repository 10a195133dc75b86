//! Credential rotation
//!
//! One state machine ([`Rotator`]) drives every credential class. The
//! classes differ only in their [`CredentialKind`]: SSH keys are appended
//! in parallel, join tokens are swapped node by node starting at the
//! primary master.

pub mod join_token;
pub mod journal;
pub mod kind;
pub mod material;
pub mod rotator;
pub mod ssh;
pub mod token;

pub use join_token::JoinTokenKind;
pub use journal::{JournalPhase, JournalStore, RotationJournal};
pub use kind::{Baseline, CredentialKind, DistributionOrder, NodeAccess};
pub use material::{CredentialClass, CredentialMaterial, RotationPolicy};
pub use rotator::{
    PhaseObserver, ReconcileOutcome, RotationOutcome, RotationPhase, RotationStatus, Rotator, Trigger,
};
pub use ssh::{managed_identity, GeneratedKey, KeyGenerator, SshKeyKind, SshKeygen};

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::registry::NodeRegistry;
use crate::remote::RemoteExecutor;
use crate::store::{ConfigStore, SecretMirror, WebhookMirror};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Wire a rotator for `class` from the cluster file
pub fn build_rotator(
    class: CredentialClass,
    config: &ClusterConfig,
    registry: Arc<NodeRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn ConfigStore>,
    cancel: CancellationToken,
) -> Result<Rotator> {
    let rotation = &config.rotation;
    let access = NodeAccess::new(registry.clone(), executor)
        .with_identity(managed_identity(store.as_ref())?)
        .with_timeouts(config.timeouts.clone())
        .with_health(config.health.clone());

    let (kind, interval): (Arc<dyn CredentialKind>, u32) = match class {
        CredentialClass::SshKey => (
            Arc::new(SshKeyKind::new(
                access,
                Arc::new(SshKeygen::default()),
                &rotation.authorized_keys_path,
                rotation.authorized_keys_window,
            )),
            rotation.ssh_interval_days,
        ),
        CredentialClass::JoinToken => (Arc::new(JoinTokenKind::new(access)), rotation.token_interval_days),
    };

    let journal = JournalStore::new(
        rotation
            .journal_dir
            .clone()
            .unwrap_or_else(JournalStore::default_dir),
    );

    let (mirror, item) = match &config.mirror {
        Some(mirror) => {
            let webhook = WebhookMirror::new(mirror)?;
            let item = webhook.item().to_string();
            (Some(Arc::new(webhook) as Arc<dyn SecretMirror>), item)
        }
        None => (None, String::new()),
    };

    Ok(Rotator::new(kind, registry, store, journal)
        .with_defaults(interval, rotation.auto_rotation)
        .with_mirror(mirror, &item)
        .with_cancel(cancel))
}
