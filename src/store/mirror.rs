//! Best-effort mirror of rotation metadata to a third-party secret manager

use crate::config::MirrorConfig;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata about a completed rotation; never the secret itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub item: String,
    pub class: String,
    pub rotation_id: String,
    pub fingerprint: String,
    pub rotated_at: DateTime<Utc>,
    pub next_rotation: DateTime<Utc>,
}

/// Receiver of rotation metadata
#[async_trait]
pub trait SecretMirror: Send + Sync {
    async fn publish(&self, record: &MirrorRecord) -> Result<()>;
}

/// Posts records as JSON to a webhook
pub struct WebhookMirror {
    url: String,
    item: String,
    client: reqwest::Client,
}

impl WebhookMirror {
    pub fn new(config: &MirrorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KeelError::Mirror(e.to_string()))?;

        Ok(Self {
            url: config.url.clone(),
            item: config.item.clone(),
            client,
        })
    }

    /// Item name records are filed under
    pub fn item(&self) -> &str {
        &self.item
    }
}

#[async_trait]
impl SecretMirror for WebhookMirror {
    async fn publish(&self, record: &MirrorRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(record)
            .send()
            .await
            .map_err(|e| KeelError::Mirror(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeelError::Mirror(format!(
                "{} answered {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Publish and swallow failures
pub async fn publish_best_effort(mirror: Option<&dyn SecretMirror>, record: &MirrorRecord) -> bool {
    let Some(mirror) = mirror else {
        return false;
    };

    match mirror.publish(record).await {
        Ok(()) => {
            tracing::info!("Mirrored {} rotation metadata to {}", record.class, record.item);
            true
        }
        Err(e) => {
            tracing::warn!("Could not mirror {} rotation metadata: {}", record.class, e);
            false
        }
    }
}
