//! Credential material and rotation policy

use crate::error::{KeelError, Result};
use crate::secret::Secret;
use crate::store::{ConfigStore, StoreValue};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of shared credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialClass {
    SshKey,
    JoinToken,
}

impl CredentialClass {
    /// Section in the config store
    pub fn store_prefix(&self) -> &'static str {
        match self {
            CredentialClass::SshKey => "ssh",
            CredentialClass::JoinToken => "k3s",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CredentialClass::SshKey => "ssh",
            CredentialClass::JoinToken => "token",
        }
    }

    pub fn key(&self, field: &str) -> String {
        format!("{}.{}", self.store_prefix(), field)
    }
}

impl std::fmt::Display for CredentialClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CredentialClass {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ssh" | "ssh-key" => Ok(CredentialClass::SshKey),
            "token" | "join-token" | "k3s" => Ok(CredentialClass::JoinToken),
            other => Err(KeelError::InvalidConfig(format!(
                "Unknown credential class: {}",
                other
            ))),
        }
    }
}

/// One version of a credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMaterial {
    /// Private key or token
    pub value: Secret,
    /// Public half, for key pairs
    #[serde(default)]
    pub public: Option<String>,
    pub created_at: DateTime<Utc>,
    pub rotation_interval_days: u32,
    pub fingerprint: String,
}

impl CredentialMaterial {
    pub fn token(value: Secret, interval_days: u32) -> Self {
        let fingerprint = fingerprint_of(value.expose().as_bytes());
        Self {
            value,
            public: None,
            created_at: Utc::now(),
            rotation_interval_days: interval_days,
            fingerprint,
        }
    }

    pub fn key_pair(private: Secret, public: String, interval_days: u32) -> Self {
        let fingerprint = ssh_fingerprint(&public);
        Self {
            value: private,
            public: Some(public),
            created_at: Utc::now(),
            rotation_interval_days: interval_days,
            fingerprint,
        }
    }
}

/// `SHA256:<unpadded base64>` of raw bytes
pub fn fingerprint_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

/// Fingerprint of an OpenSSH public key line, as `ssh-keygen -l` prints it
pub fn ssh_fingerprint(public_line: &str) -> String {
    let blob = public_line.split_whitespace().nth(1).unwrap_or(public_line);
    match base64::engine::general_purpose::STANDARD.decode(blob) {
        Ok(bytes) => fingerprint_of(&bytes),
        Err(_) => fingerprint_of(blob.as_bytes()),
    }
}

/// When a credential class is due for rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub interval_days: u32,
    pub auto_rotation_enabled: bool,
    pub last_rotation: Option<DateTime<Utc>>,
    pub next_rotation: Option<DateTime<Utc>>,
}

impl RotationPolicy {
    /// Read the policy for `class`; missing values fall back to the defaults
    pub fn load(
        store: &dyn ConfigStore,
        class: CredentialClass,
        default_interval: u32,
        default_auto: bool,
    ) -> Result<Self> {
        let interval_days = match store.get_plain(&class.key("rotation_interval_days"))? {
            Some(v) => v.trim().parse().map_err(|_| {
                KeelError::Store(format!("{}: not a number: {}", class.key("rotation_interval_days"), v))
            })?,
            None => default_interval,
        };
        let auto_rotation_enabled = match store.get_plain(&class.key("auto_rotation"))? {
            Some(v) => v.trim().parse().map_err(|_| {
                KeelError::Store(format!("{}: not a boolean: {}", class.key("auto_rotation"), v))
            })?,
            None => default_auto,
        };

        Ok(Self {
            interval_days,
            auto_rotation_enabled,
            last_rotation: read_time(store, &class.key("last_rotation"))?,
            next_rotation: read_time(store, &class.key("next_rotation"))?,
        })
    }

    /// Next due time; `None` means never rotated
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.next_rotation.or_else(|| {
            self.last_rotation
                .map(|last| last + Duration::days(i64::from(self.interval_days)))
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at().map(|due| now >= due).unwrap_or(true)
    }

    /// Time left until due, zero when overdue
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.due_at()
            .map(|due| (due - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    /// Policy after a rotation completed at `at`
    pub fn rotated_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            interval_days: self.interval_days,
            auto_rotation_enabled: self.auto_rotation_enabled,
            last_rotation: Some(at),
            next_rotation: Some(at + Duration::days(i64::from(self.interval_days))),
        }
    }

    /// Store entries describing this policy
    pub fn store_entries(&self, class: CredentialClass) -> Vec<(String, StoreValue)> {
        let mut entries = vec![
            (
                class.key("rotation_interval_days"),
                StoreValue::plain(self.interval_days.to_string()),
            ),
            (
                class.key("auto_rotation"),
                StoreValue::plain(self.auto_rotation_enabled.to_string()),
            ),
        ];
        if let Some(last) = self.last_rotation {
            entries.push((class.key("last_rotation"), StoreValue::plain(last.to_rfc3339())));
        }
        if let Some(next) = self.next_rotation {
            entries.push((class.key("next_rotation"), StoreValue::plain(next.to_rfc3339())));
        }
        entries
    }
}

fn read_time(store: &dyn ConfigStore, path: &str) -> Result<Option<DateTime<Utc>>> {
    store
        .get_plain(path)?
        .map(|v| {
            DateTime::parse_from_rfc3339(v.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| KeelError::Store(format!("{}: {}", path, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_fingerprints() {
        let a = fingerprint_of(b"K10aaa::server:bbb");
        assert!(a.starts_with("SHA256:"));
        assert!(!a.ends_with('='));
        assert_eq!(a, fingerprint_of(b"K10aaa::server:bbb"));
        assert_ne!(a, fingerprint_of(b"K10aaa::server:bbc"));

        let blob = base64::engine::general_purpose::STANDARD.encode(b"key-blob");
        let line = format!("ssh-ed25519 {} keel-managed@ops", blob);
        assert_eq!(ssh_fingerprint(&line), fingerprint_of(b"key-blob"));
        // comment does not matter
        assert_eq!(
            ssh_fingerprint(&format!("ssh-ed25519 {} other", blob)),
            ssh_fingerprint(&line)
        );
    }

    #[test]
    fn test_policy_defaults_and_due() {
        let store = MemoryStore::new();
        let policy = RotationPolicy::load(&store, CredentialClass::SshKey, 90, true).unwrap();

        assert_eq!(policy.interval_days, 90);
        assert!(policy.auto_rotation_enabled);
        assert!(policy.is_due(Utc::now()));
        assert!(policy.due_at().is_none());
    }

    #[test]
    fn test_policy_round_trip_through_store() {
        let store = MemoryStore::new();
        store
            .set("k3s.rotation_interval_days", StoreValue::plain("30"))
            .unwrap();
        let now = Utc::now();
        let policy = RotationPolicy::load(&store, CredentialClass::JoinToken, 90, true)
            .unwrap()
            .rotated_at(now);
        store.set_many(policy.store_entries(CredentialClass::JoinToken)).unwrap();

        let loaded = RotationPolicy::load(&store, CredentialClass::JoinToken, 90, true).unwrap();
        assert_eq!(loaded.interval_days, 30);
        assert!(!loaded.is_due(now + Duration::days(29)));
        assert!(loaded.is_due(now + Duration::days(30)));
        assert!(loaded.remaining(now).num_days() >= 29);
        assert_eq!(loaded.remaining(now + Duration::days(40)), Duration::zero());
    }

    #[test]
    fn test_bad_stored_values() {
        let store = MemoryStore::new();
        store.set("ssh.auto_rotation", StoreValue::plain("sometimes")).unwrap();
        assert!(RotationPolicy::load(&store, CredentialClass::SshKey, 90, true).is_err());
    }

    #[test]
    fn test_class_names() {
        assert_eq!("ssh".parse::<CredentialClass>().unwrap(), CredentialClass::SshKey);
        assert_eq!("token".parse::<CredentialClass>().unwrap(), CredentialClass::JoinToken);
        assert!("gpg".parse::<CredentialClass>().is_err());
        assert_eq!(CredentialClass::JoinToken.key("token"), "k3s.token");
    }
}
