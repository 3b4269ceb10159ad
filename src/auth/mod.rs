//! Authentication and authorization.
//!
//! [`AuthService`] resolves an inbound [`Credential`] into a
//! [`RequestContext`]:
//!
//! 1. the validator for the credential kind checks existence, revocation and
//!    expiry (API keys and sessions in storage, bearer tokens by signature),
//! 2. the resolved subject is charged one token from its rate-limit bucket,
//! 3. the attempt is appended to the audit log, success or failure.
//!
//! Authorization is separate: [`RequestContext::authorize`] checks a scope set.

mod api_key;
mod audit;
mod context;
mod rate_limiter;
mod revocation;
mod session;
mod token;

pub use api_key::{ApiKeyRecord, ApiKeyStore, IssuedApiKey};
pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use context::{CredentialKind, Grant, RequestContext, Scopes};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use revocation::RevocationList;
pub use session::{SessionRecord, SessionStore};
pub use token::{AccessClaims, RefreshTokenRecord, TokenPair, TokenService, TokenSigner};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::StorageAdapter;
use crate::types::{AuthConfig, Error, Result, SubjectId, TokenId};

/// Hex SHA-256 of a raw secret; the storage key for keys and refresh tokens.
pub(crate) fn digest_hex(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// 32 random bytes, base64url encoded, behind a kind prefix.
pub(crate) fn generate_secret(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
}

// =============================================================================
// Credentials
// =============================================================================

/// A credential as presented by a caller.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Session(String),
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.kind())
    }
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::ApiKey(_) => CredentialKind::ApiKey,
            Credential::Session(_) => CredentialKind::Session,
            Credential::Bearer(_) => CredentialKind::Jwt,
        }
    }

    /// Extract a credential from transport headers.
    ///
    /// Header names match case-insensitively. Precedence is
    /// `Authorization: Bearer`, then the API key header, then the session
    /// cookie.
    pub fn from_headers<'a>(
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        api_key_header: &str,
        session_cookie: &str,
    ) -> Option<Credential> {
        let mut bearer = None;
        let mut api_key = None;
        let mut session = None;

        for (name, value) in headers {
            let value = value.trim();
            if name.eq_ignore_ascii_case("authorization") {
                if let Some((scheme, token)) = value.split_once(' ') {
                    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
                        bearer = Some(token.trim().to_string());
                    }
                }
            } else if name.eq_ignore_ascii_case(api_key_header) {
                if !value.is_empty() {
                    api_key = Some(value.to_string());
                }
            } else if name.eq_ignore_ascii_case("cookie") {
                session = session.or_else(|| cookie_value(value, session_cookie));
            }
        }

        bearer
            .map(Credential::Bearer)
            .or(api_key.map(Credential::ApiKey))
            .or(session.map(Credential::Session))
    }
}

fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

/// Records removed by one cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub api_keys: usize,
    pub sessions: usize,
    pub refresh_tokens: usize,
    pub idle_buckets: usize,
}

// =============================================================================
// Auth service
// =============================================================================

#[derive(Debug)]
pub struct AuthService {
    config: AuthConfig,
    api_keys: ApiKeyStore,
    sessions: SessionStore,
    tokens: TokenService,
    limiter: RateLimiter,
    revocations: Arc<RevocationList>,
    audit: AuditLog,
}

impl AuthService {
    /// Build the subsystem over `storage` and hydrate the revocation list.
    pub async fn open(config: &AuthConfig, storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        let secret = match &config.token_secret {
            Some(secret) => secret.clone(),
            None => {
                tracing::warn!("no token secret configured, bearer tokens will not survive a restart");
                generate_secret("")
            }
        };

        let limiter = RateLimiter::new(config.rate_limit.clone())?;

        let revocations = Arc::new(RevocationList::new(storage.clone()));
        revocations.hydrate().await?;

        Ok(Self {
            config: config.clone(),
            api_keys: ApiKeyStore::new(storage.clone(), revocations.clone()),
            sessions: SessionStore::new(storage.clone(), revocations.clone()),
            tokens: TokenService::new(
                TokenSigner::new(secret),
                storage.clone(),
                revocations.clone(),
                config.access_token_ttl,
                config.refresh_token_ttl,
            ),
            limiter,
            revocations,
            audit: AuditLog::new(storage),
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn api_keys(&self) -> &ApiKeyStore {
        &self.api_keys
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn revocations(&self) -> &RevocationList {
        &self.revocations
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Parse transport headers using the configured header and cookie names.
    pub fn credential_from_headers<'a>(
        &self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Option<Credential> {
        Credential::from_headers(
            headers,
            &self.config.api_key_header,
            &self.config.session_cookie,
        )
    }

    // =============================================================================
    // Authentication
    // =============================================================================

    /// Resolve a credential, charge the subject's rate limit and audit the
    /// attempt.
    ///
    /// A successful attempt whose audit entry cannot be stored fails with the
    /// storage error. A failed attempt always returns its own error; an audit
    /// write failure on that path is logged instead.
    pub async fn authenticate(&self, credential: &Credential) -> Result<RequestContext> {
        let kind = credential.kind();
        let resolved = match credential {
            Credential::ApiKey(raw) => self.api_keys.validate(raw).await,
            Credential::Session(id) => self.sessions.validate(id).await,
            Credential::Bearer(token) => self.tokens.validate_access(token).await,
        };

        let context = match resolved {
            Ok(context) => context,
            Err(e) => return Err(self.audit_failure(None, kind, e).await),
        };

        if let Err(e) = self.limiter.check_and_consume(context.subject.as_str()) {
            return Err(self
                .audit_failure(Some(context.subject.clone()), kind, e)
                .await);
        }

        self.audit.record(AuditEntry::success(&context)).await?;
        Ok(context)
    }

    /// Exchange a refresh token. Audited and rate-limited like `authenticate`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let kind = CredentialKind::RefreshToken;
        let (subject, pair) = match self.tokens.refresh(refresh_token).await {
            Ok(exchanged) => exchanged,
            Err(e) => return Err(self.audit_failure(None, kind, e).await),
        };

        if let Err(e) = self.limiter.check_and_consume(subject.as_str()) {
            return Err(self.audit_failure(Some(subject), kind, e).await);
        }

        self.audit
            .record(AuditEntry {
                timestamp: Utc::now(),
                subject: Some(subject),
                kind,
                outcome: AuditOutcome::Success,
            })
            .await?;
        Ok(pair)
    }

    async fn audit_failure(
        &self,
        subject: Option<SubjectId>,
        kind: CredentialKind,
        error: Error,
    ) -> Error {
        if let Err(audit_err) = self
            .audit
            .record(AuditEntry::failure(subject, kind, &error))
            .await
        {
            tracing::error!(error = %audit_err, "failed to store audit entry");
        }
        error
    }

    // =============================================================================
    // Issuance and revocation
    // =============================================================================

    /// Create an API key. `ttl` falls back to the configured default.
    pub async fn create_api_key(&self, grant: Grant, ttl: Option<Duration>) -> Result<IssuedApiKey> {
        let expires_at = match ttl.or(self.config.api_key_ttl) {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| Error::validation(format!("api key ttl out of range: {}", e)))?,
            ),
            None => None,
        };
        self.api_keys.create(grant, expires_at).await
    }

    pub async fn revoke_api_key(&self, id: &str) -> Result<bool> {
        self.api_keys.revoke(id).await
    }

    pub async fn rotate_api_key(&self, id: &str) -> Result<IssuedApiKey> {
        self.api_keys.rotate(id).await
    }

    pub async fn list_api_keys(&self, subject: &SubjectId) -> Result<Vec<ApiKeyRecord>> {
        self.api_keys.list(subject).await
    }

    /// Open a session with the configured lifetime.
    pub async fn create_session(&self, grant: Grant) -> Result<SessionRecord> {
        self.sessions
            .create(grant, Some(self.config.session_ttl))
            .await
    }

    pub async fn list_sessions(&self, subject: &SubjectId) -> Result<Vec<SessionRecord>> {
        self.sessions.list(subject).await
    }

    pub async fn revoke_session(&self, id: &str) -> Result<bool> {
        self.sessions.revoke(id).await
    }

    pub async fn revoke_all_sessions(&self, subject: &SubjectId) -> Result<usize> {
        self.sessions.revoke_all(subject).await
    }

    pub async fn issue_tokens(&self, grant: Grant) -> Result<TokenPair> {
        self.tokens.issue(grant).await
    }

    pub async fn revoke_access_token(&self, jti: &str) -> Result<()> {
        self.tokens.revoke_access(jti).await
    }

    pub async fn revoke_token_family(&self, family: &TokenId) -> Result<()> {
        self.tokens.revoke_family(family).await
    }

    pub async fn is_revoked(&self, kind: CredentialKind, id: &str) -> bool {
        self.revocations.is_revoked(kind, id).await
    }

    /// Delete expired credential records and drop idle rate-limit buckets.
    pub async fn purge_expired(&self, now: DateTime<Utc>, idle: Duration) -> Result<PurgeReport> {
        Ok(PurgeReport {
            api_keys: self.api_keys.purge_expired(now).await?,
            sessions: self.sessions.purge_expired(now).await?,
            refresh_tokens: self.tokens.purge_expired(now).await?,
            idle_buckets: self.limiter.cleanup_idle(idle),
        })
    }
}
