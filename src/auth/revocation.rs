//! Revocation list shared by every credential validator.
//!
//! Revocations are held in memory for a storage-free `is_revoked` check and
//! written through to storage so they survive restarts. Revoking an id that
//! was never issued is allowed and takes effect like any other revocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::CredentialKind;
use crate::storage::StorageAdapter;
use crate::types::Result;

pub(crate) const REVOCATIONS_NAMESPACE: &str = "auth.revocations";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevocationRecord {
    kind: CredentialKind,
    id: String,
    revoked_at: DateTime<Utc>,
}

fn storage_key(kind: CredentialKind, id: &str) -> String {
    format!("{}:{}", kind, id)
}

/// Set of revoked `(kind, id)` pairs.
#[derive(Debug)]
pub struct RevocationList {
    storage: Arc<dyn StorageAdapter>,
    revoked: RwLock<HashSet<(CredentialKind, String)>>,
}

impl RevocationList {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Load persisted revocations. Returns how many are now known.
    pub async fn hydrate(&self) -> Result<usize> {
        let keys = self.storage.list(REVOCATIONS_NAMESPACE).await?;
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            let parsed = key
                .split_once(':')
                .and_then(|(kind, id)| Some((CredentialKind::parse(kind)?, id.to_string())));
            match parsed {
                Some(pair) => loaded.push(pair),
                None => tracing::warn!(key, "skipping malformed revocation key"),
            }
        }

        let mut revoked = self.revoked.write().await;
        revoked.extend(loaded);
        tracing::debug!(count = revoked.len(), "revocations_hydrated");
        Ok(revoked.len())
    }

    pub async fn is_revoked(&self, kind: CredentialKind, id: &str) -> bool {
        self.revoked
            .read()
            .await
            .contains(&(kind, id.to_string()))
    }

    /// Revoke immediately, then persist.
    ///
    /// The in-memory revocation holds even if persisting fails; the error is
    /// returned so the caller knows it will not survive a restart.
    pub async fn revoke(&self, kind: CredentialKind, id: &str) -> Result<()> {
        let newly = self.revoked.write().await.insert((kind, id.to_string()));
        if !newly {
            return Ok(());
        }

        let record = RevocationRecord {
            kind,
            id: id.to_string(),
            revoked_at: Utc::now(),
        };
        self.storage
            .set(
                REVOCATIONS_NAMESPACE,
                &storage_key(kind, id),
                serde_json::to_value(&record)?,
            )
            .await?;
        tracing::info!(kind = %kind, id, "credential_revoked");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.revoked.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.revoked.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_revoke_unknown_id_is_allowed() {
        let list = RevocationList::new(Arc::new(MemoryStorage::new()));
        assert!(!list.is_revoked(CredentialKind::Session, "never-issued").await);

        list.revoke(CredentialKind::Session, "never-issued")
            .await
            .unwrap();
        assert!(list.is_revoked(CredentialKind::Session, "never-issued").await);
        // Kinds are separate id spaces.
        assert!(!list.is_revoked(CredentialKind::ApiKey, "never-issued").await);
    }

    #[tokio::test]
    async fn test_revocations_survive_restart() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        let first = RevocationList::new(storage.clone());
        first.revoke(CredentialKind::Jwt, "jti-1").await.unwrap();
        first.revoke(CredentialKind::ApiKey, "key-1").await.unwrap();
        first.revoke(CredentialKind::ApiKey, "key-1").await.unwrap();

        let second = RevocationList::new(storage);
        assert_eq!(second.hydrate().await.unwrap(), 2);
        assert!(second.is_revoked(CredentialKind::Jwt, "jti-1").await);
        assert!(second.is_revoked(CredentialKind::ApiKey, "key-1").await);
    }

    #[tokio::test]
    async fn test_hydrate_skips_malformed_keys() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        storage
            .set(REVOCATIONS_NAMESPACE, "garbage", serde_json::Value::Null)
            .await
            .unwrap();
        storage
            .set(REVOCATIONS_NAMESPACE, "session:abc", serde_json::Value::Null)
            .await
            .unwrap();

        let list = RevocationList::new(storage);
        assert_eq!(list.hydrate().await.unwrap(), 1);
        assert!(list.is_revoked(CredentialKind::Session, "abc").await);
    }
}
