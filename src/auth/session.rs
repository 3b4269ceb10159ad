//! Sessions.
//!
//! Session ids are random UUIDs handed to the client as a cookie and used
//! directly as the storage key. Like API keys, an expired session is deleted
//! by whichever read discovers the expiry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{CredentialKind, Grant, RequestContext, RevocationList, Scopes};
use crate::storage::StorageAdapter;
use crate::types::{Error, Result, SessionId, SubjectId};

pub(crate) const SESSIONS_NAMESPACE: &str = "auth.sessions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub subject: SubjectId,
    pub scopes: Scopes,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl SessionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Debug)]
pub struct SessionStore {
    storage: Arc<dyn StorageAdapter>,
    revocations: Arc<RevocationList>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, revocations: Arc<RevocationList>) -> Self {
        Self {
            storage,
            revocations,
        }
    }

    async fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        match self.storage.get(SESSIONS_NAMESPACE, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &SessionRecord) -> Result<()> {
        self.storage
            .set(
                SESSIONS_NAMESPACE,
                record.id.as_str(),
                serde_json::to_value(record)?,
            )
            .await
    }

    async fn scan(&self) -> Result<Vec<SessionRecord>> {
        self.storage
            .scan(SESSIONS_NAMESPACE)
            .await?
            .into_iter()
            .map(|(_, value)| -> Result<SessionRecord> { Ok(serde_json::from_value(value)?) })
            .collect()
    }

    /// Open a session. `ttl` of `None` creates a session that never expires.
    pub async fn create(&self, grant: Grant, ttl: Option<Duration>) -> Result<SessionRecord> {
        let now = Utc::now();
        let expires_at = match ttl {
            Some(ttl) => Some(
                now + ChronoDuration::from_std(ttl)
                    .map_err(|e| Error::validation(format!("session ttl out of range: {}", e)))?,
            ),
            None => None,
        };
        let record = SessionRecord {
            id: SessionId::new(),
            subject: grant.subject,
            scopes: grant.scopes,
            is_admin: grant.is_admin,
            created_at: now,
            expires_at,
            revoked: false,
        };
        self.save(&record).await?;
        tracing::debug!(id = %record.id, subject = %record.subject, "session_created");
        Ok(record)
    }

    pub async fn validate(&self, id: &str) -> Result<RequestContext> {
        self.validate_at(id, Utc::now()).await
    }

    /// Resolve a session id. The revocation list is consulted before storage,
    /// so an id revoked before it was ever seen is still rejected as revoked.
    pub async fn validate_at(&self, id: &str, now: DateTime<Utc>) -> Result<RequestContext> {
        if self.revocations.is_revoked(CredentialKind::Session, id).await {
            return Err(Error::unauthorized("session revoked"));
        }
        let record = self
            .load(id)
            .await?
            .ok_or_else(|| Error::unauthorized("unknown session"))?;
        if record.revoked {
            return Err(Error::unauthorized("session revoked"));
        }
        if record.is_expired_at(now) {
            self.storage.delete(SESSIONS_NAMESPACE, id).await?;
            tracing::debug!(id, "expired_session_deleted");
            return Err(Error::unauthorized("session expired"));
        }

        let grant = Grant {
            subject: record.subject,
            scopes: record.scopes,
            is_admin: record.is_admin,
        };
        Ok(grant.into_context(CredentialKind::Session, id))
    }

    /// Active sessions of a subject, oldest first. Expired sessions met along
    /// the way are deleted.
    pub async fn list(&self, subject: &SubjectId) -> Result<Vec<SessionRecord>> {
        let now = Utc::now();
        let mut active = Vec::new();
        for record in self.scan().await? {
            if &record.subject != subject {
                continue;
            }
            if record.is_expired_at(now) {
                self.storage
                    .delete(SESSIONS_NAMESPACE, record.id.as_str())
                    .await?;
                continue;
            }
            if !record.revoked
                && !self
                    .revocations
                    .is_revoked(CredentialKind::Session, record.id.as_str())
                    .await
            {
                active.push(record);
            }
        }
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    /// Revoke one session id, known or not. Returns whether a stored record
    /// was found.
    pub async fn revoke(&self, id: &str) -> Result<bool> {
        self.revocations.revoke(CredentialKind::Session, id).await?;
        match self.load(id).await? {
            Some(mut record) => {
                record.revoked = true;
                self.save(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Revoke every active session of a subject. Returns how many were revoked.
    pub async fn revoke_all(&self, subject: &SubjectId) -> Result<usize> {
        let sessions = self.list(subject).await?;
        for record in &sessions {
            self.revoke(record.id.as_str()).await?;
        }
        tracing::info!(subject = %subject, count = sessions.len(), "sessions_revoked");
        Ok(sessions.len())
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for record in self.scan().await? {
            if record.is_expired_at(now) {
                self.storage
                    .delete(SESSIONS_NAMESPACE, record.id.as_str())
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
