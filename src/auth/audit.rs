//! Append-only authentication audit log.
//!
//! Every attempt is emitted as a `tracing` event on target `hub_core::audit`
//! and stored under a time-sortable key, so `list` order is append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{CredentialKind, RequestContext};
use crate::storage::StorageAdapter;
use crate::types::{Error, Result, SubjectId};

pub(crate) const AUDIT_NAMESPACE: &str = "auth.audit";

/// Result of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub subject: Option<SubjectId>,
    pub kind: CredentialKind,
    pub outcome: AuditOutcome,
}

impl AuditEntry {
    pub fn success(context: &RequestContext) -> Self {
        Self {
            timestamp: Utc::now(),
            subject: Some(context.subject.clone()),
            kind: context.source,
            outcome: AuditOutcome::Success,
        }
    }

    pub fn failure(subject: Option<SubjectId>, kind: CredentialKind, error: &Error) -> Self {
        Self {
            timestamp: Utc::now(),
            subject,
            kind,
            outcome: AuditOutcome::Failure {
                reason: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Success)
    }
}

#[derive(Debug)]
pub struct AuditLog {
    storage: Arc<dyn StorageAdapter>,
    seq: AtomicU64,
}

impl AuditLog {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            seq: AtomicU64::new(0),
        }
    }

    /// Append one entry.
    pub async fn record(&self, entry: AuditEntry) -> Result<()> {
        let subject = entry.subject.as_ref().map(SubjectId::as_str).unwrap_or("-");
        match &entry.outcome {
            AuditOutcome::Success => tracing::info!(
                target: "hub_core::audit",
                subject,
                kind = %entry.kind,
                "auth_success"
            ),
            AuditOutcome::Failure { reason } => tracing::warn!(
                target: "hub_core::audit",
                subject,
                kind = %entry.kind,
                reason = %reason,
                "auth_failure"
            ),
        }

        // Microsecond timestamp plus a process-local sequence keeps keys
        // unique and ordered within one process.
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let key = format!(
            "{:020}-{:010}",
            entry.timestamp.timestamp_micros().max(0),
            seq
        );
        self.storage
            .set(AUDIT_NAMESPACE, &key, serde_json::to_value(&entry)?)
            .await
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.storage
            .scan(AUDIT_NAMESPACE)
            .await?
            .into_iter()
            .map(|(_, value)| -> Result<AuditEntry> { Ok(serde_json::from_value(value)?) })
            .collect()
    }

    pub async fn entries_for(&self, subject: &SubjectId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.subject.as_ref() == Some(subject))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scopes;
    use crate::storage::MemoryStorage;
    use tracing_test::traced_test;

    fn ctx() -> RequestContext {
        RequestContext {
            subject: SubjectId::must("alice"),
            scopes: Scopes::new(),
            is_admin: false,
            source: CredentialKind::Session,
            credential_id: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_entries_keep_append_order() {
        let log = AuditLog::new(Arc::new(MemoryStorage::new()));
        log.record(AuditEntry::success(&ctx())).await.unwrap();
        log.record(AuditEntry::failure(
            None,
            CredentialKind::ApiKey,
            &Error::unauthorized("unknown api key"),
        ))
        .await
        .unwrap();
        log.record(AuditEntry::success(&ctx())).await.unwrap();

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_success());
        assert_eq!(entries[1].kind, CredentialKind::ApiKey);
        assert!(matches!(
            &entries[1].outcome,
            AuditOutcome::Failure { reason } if reason.contains("unknown api key")
        ));

        let alice = log.entries_for(&SubjectId::must("alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failures_are_traced() {
        let log = AuditLog::new(Arc::new(MemoryStorage::new()));
        log.record(AuditEntry::failure(
            Some(SubjectId::must("mallory")),
            CredentialKind::Jwt,
            &Error::unauthorized("bad signature"),
        ))
        .await
        .unwrap();

        assert!(logs_contain("auth_failure"));
        assert!(logs_contain("mallory"));
    }
}
