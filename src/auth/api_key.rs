//! API keys.
//!
//! Raw keys are shown once, at creation. Storage only ever sees the SHA-256
//! digest of a key, which is also the lookup key for validation.
//!
//! Validation has a documented side effect: a key found expired is deleted
//! by the call that discovers the expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    digest_hex, generate_secret, CredentialKind, Grant, RequestContext, RevocationList, Scopes,
};
use crate::storage::StorageAdapter;
use crate::types::{CredentialId, Error, Result, SubjectId};

pub(crate) const API_KEYS_NAMESPACE: &str = "auth.api_keys";
const KEY_PREFIX: &str = "hk_";

/// Persisted API key metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: CredentialId,
    pub subject: SubjectId,
    pub scopes: Scopes,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    fn grant(&self) -> Grant {
        Grant {
            subject: self.subject.clone(),
            scopes: self.scopes.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// A freshly created key. `raw` is not recoverable afterwards.
#[derive(Clone)]
pub struct IssuedApiKey {
    pub raw: String,
    pub record: ApiKeyRecord,
}

impl std::fmt::Debug for IssuedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedApiKey")
            .field("raw", &"<redacted>")
            .field("record", &self.record)
            .finish()
    }
}

#[derive(Debug)]
pub struct ApiKeyStore {
    storage: Arc<dyn StorageAdapter>,
    revocations: Arc<RevocationList>,
}

impl ApiKeyStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, revocations: Arc<RevocationList>) -> Self {
        Self {
            storage,
            revocations,
        }
    }

    async fn load(&self, digest: &str) -> Result<Option<ApiKeyRecord>> {
        match self.storage.get(API_KEYS_NAMESPACE, digest).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, digest: &str, record: &ApiKeyRecord) -> Result<()> {
        self.storage
            .set(API_KEYS_NAMESPACE, digest, serde_json::to_value(record)?)
            .await
    }

    /// Every stored record with its digest.
    async fn scan(&self) -> Result<Vec<(String, ApiKeyRecord)>> {
        self.storage
            .scan(API_KEYS_NAMESPACE)
            .await?
            .into_iter()
            .map(|(digest, value)| -> Result<(String, ApiKeyRecord)> {
                Ok((digest, serde_json::from_value(value)?))
            })
            .collect()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<(String, ApiKeyRecord)>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .find(|(_, record)| record.id.as_str() == id))
    }

    pub async fn create(
        &self,
        grant: Grant,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedApiKey> {
        let raw = generate_secret(KEY_PREFIX);
        let record = ApiKeyRecord {
            id: CredentialId::new(),
            subject: grant.subject,
            scopes: grant.scopes,
            is_admin: grant.is_admin,
            created_at: Utc::now(),
            expires_at,
            revoked: false,
        };
        self.save(&digest_hex(&raw), &record).await?;
        tracing::info!(id = %record.id, subject = %record.subject, "api_key_created");
        Ok(IssuedApiKey { raw, record })
    }

    /// Resolve a raw key.
    ///
    /// An expired key is deleted before `Unauthorized` is returned, so a
    /// second attempt finds nothing at all.
    pub async fn validate(&self, raw: &str) -> Result<RequestContext> {
        self.validate_at(raw, Utc::now()).await
    }

    pub async fn validate_at(&self, raw: &str, now: DateTime<Utc>) -> Result<RequestContext> {
        let digest = digest_hex(raw);
        let record = self
            .load(&digest)
            .await?
            .ok_or_else(|| Error::unauthorized("unknown api key"))?;

        if record.revoked
            || self
                .revocations
                .is_revoked(CredentialKind::ApiKey, record.id.as_str())
                .await
        {
            return Err(Error::unauthorized("api key revoked"));
        }
        if record.is_expired_at(now) {
            self.storage.delete(API_KEYS_NAMESPACE, &digest).await?;
            tracing::debug!(id = %record.id, "expired_api_key_deleted");
            return Err(Error::unauthorized("api key expired"));
        }

        let id = record.id.to_string();
        Ok(record.grant().into_context(CredentialKind::ApiKey, id))
    }

    /// Revoke by key id. Returns whether a stored record was found; unknown
    /// ids are still added to the revocation list.
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        self.revocations.revoke(CredentialKind::ApiKey, id).await?;
        match self.find_by_id(id).await? {
            Some((digest, mut record)) => {
                record.revoked = true;
                self.save(&digest, &record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace a key with a new one carrying the same grant and expiry. The
    /// old key is revoked once the new one is stored.
    pub async fn rotate(&self, id: &str) -> Result<IssuedApiKey> {
        let (_, record) = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("api key {}", id)))?;
        if record.revoked || self.revocations.is_revoked(CredentialKind::ApiKey, id).await {
            return Err(Error::validation(format!("api key {} is revoked", id)));
        }

        let issued = self.create(record.grant(), record.expires_at).await?;
        self.revoke(id).await?;
        tracing::info!(old = id, new = %issued.record.id, "api_key_rotated");
        Ok(issued)
    }

    /// Live keys of a subject. Expired keys met along the way are deleted.
    pub async fn list(&self, subject: &SubjectId) -> Result<Vec<ApiKeyRecord>> {
        let now = Utc::now();
        let mut live = Vec::new();
        for (digest, record) in self.scan().await? {
            if &record.subject != subject {
                continue;
            }
            if record.is_expired_at(now) {
                self.storage.delete(API_KEYS_NAMESPACE, &digest).await?;
                continue;
            }
            if !record.revoked {
                live.push(record);
            }
        }
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(live)
    }

    /// Delete every expired record. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for (digest, record) in self.scan().await? {
            if record.is_expired_at(now) {
                self.storage.delete(API_KEYS_NAMESPACE, &digest).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
