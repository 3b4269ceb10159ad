//! Signed bearer tokens with rotating refresh tokens.
//!
//! Access tokens are `header.claims.signature`, each segment base64url without
//! padding, signed with HMAC-SHA256. They are checked without touching
//! storage; only the revocation predicate is consulted afterwards.
//!
//! Refresh tokens are opaque random strings stored by digest. Each one is
//! single-use: `refresh` revokes the presented token and mints a new pair in
//! the same family. Presenting a token that was already rotated revokes the
//! whole family, cutting off whoever holds the newer tokens as well.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    digest_hex, generate_secret, CredentialKind, Grant, RequestContext, RevocationList, Scopes,
};
use crate::storage::StorageAdapter;
use crate::types::{Error, Result, SubjectId, TokenId};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const REFRESH_TOKENS_NAMESPACE: &str = "auth.refresh_tokens";
const REFRESH_PREFIX: &str = "hr_";
const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: SubjectId,
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default)]
    pub adm: bool,
    pub jti: TokenId,
    /// Refresh family this token was minted in.
    pub fam: TokenId,
    pub iat: i64,
    pub exp: i64,
}

/// An access/refresh pair as returned to the client.
#[derive(Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: TokenId,
    pub family: TokenId,
    pub subject: SubjectId,
    pub scopes: Scopes,
    pub is_admin: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set once the token has been exchanged or explicitly revoked.
    pub revoked: bool,
}

impl RefreshTokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

// =============================================================================
// Signer
// =============================================================================

/// HMAC-SHA256 signer for access tokens.
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::internal(format!("invalid signing key: {}", e)))
    }

    pub fn sign(&self, claims: &AccessClaims) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(HEADER);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{}.{}", header, body);

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Check the signature and decode the claims. Expiry is not checked here.
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let malformed = || Error::unauthorized("malformed bearer token");

        let parts: Vec<&str> = token.split('.').collect();
        let [header, body, signature] = parts[..] else {
            return Err(malformed());
        };

        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| malformed())?;
        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::unauthorized("invalid token signature"))?;

        let header = URL_SAFE_NO_PAD.decode(header).map_err(|_| malformed())?;
        if header != HEADER.as_bytes() {
            return Err(Error::unauthorized("unsupported token header"));
        }
        let body = URL_SAFE_NO_PAD.decode(body).map_err(|_| malformed())?;
        serde_json::from_slice(&body).map_err(|_| malformed())
    }
}

// =============================================================================
// Token service
// =============================================================================

#[derive(Debug)]
pub struct TokenService {
    signer: TokenSigner,
    storage: Arc<dyn StorageAdapter>,
    revocations: Arc<RevocationList>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    /// Serializes refresh exchanges so one refresh token cannot be spent twice.
    refresh_lock: Mutex<()>,
}

fn chrono_ttl(ttl: Duration) -> Result<ChronoDuration> {
    ChronoDuration::from_std(ttl)
        .map_err(|e| Error::config(format!("token ttl out of range: {}", e)))
}

impl TokenService {
    pub fn new(
        signer: TokenSigner,
        storage: Arc<dyn StorageAdapter>,
        revocations: Arc<RevocationList>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            signer,
            storage,
            revocations,
            access_ttl,
            refresh_ttl,
            refresh_lock: Mutex::new(()),
        }
    }

    async fn load_refresh(&self, digest: &str) -> Result<Option<RefreshTokenRecord>> {
        match self.storage.get(REFRESH_TOKENS_NAMESPACE, digest).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save_refresh(&self, digest: &str, record: &RefreshTokenRecord) -> Result<()> {
        self.storage
            .set(REFRESH_TOKENS_NAMESPACE, digest, serde_json::to_value(record)?)
            .await
    }

    async fn mint(&self, grant: Grant, family: TokenId, now: DateTime<Utc>) -> Result<TokenPair> {
        let access_expires_at = now + chrono_ttl(self.access_ttl)?;
        let refresh_expires_at = now + chrono_ttl(self.refresh_ttl)?;

        let claims = AccessClaims {
            sub: grant.subject.clone(),
            scopes: grant.scopes.clone(),
            adm: grant.is_admin,
            jti: TokenId::new(),
            fam: family.clone(),
            iat: now.timestamp(),
            exp: access_expires_at.timestamp(),
        };
        let access_token = self.signer.sign(&claims)?;

        let refresh_token = generate_secret(REFRESH_PREFIX);
        let record = RefreshTokenRecord {
            id: TokenId::new(),
            family,
            subject: grant.subject,
            scopes: grant.scopes,
            is_admin: grant.is_admin,
            issued_at: now,
            expires_at: Some(refresh_expires_at),
            revoked: false,
        };
        self.save_refresh(&digest_hex(&refresh_token), &record).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Issue a fresh pair in a new family.
    pub async fn issue(&self, grant: Grant) -> Result<TokenPair> {
        let subject = grant.subject.clone();
        let pair = self.mint(grant, TokenId::new(), Utc::now()).await?;
        tracing::debug!(subject = %subject, "tokens_issued");
        Ok(pair)
    }

    pub async fn validate_access(&self, token: &str) -> Result<RequestContext> {
        self.validate_access_at(token, Utc::now()).await
    }

    pub async fn validate_access_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RequestContext> {
        let claims = self.signer.verify(token)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| Error::unauthorized("malformed bearer token"))?;
        if expires_at <= now {
            return Err(Error::unauthorized("bearer token expired"));
        }
        if self
            .revocations
            .is_revoked(CredentialKind::Jwt, claims.jti.as_str())
            .await
            || self.is_family_revoked(&claims.fam).await
        {
            return Err(Error::unauthorized("bearer token revoked"));
        }

        let grant = Grant {
            subject: claims.sub,
            scopes: claims.scopes,
            is_admin: claims.adm,
        };
        Ok(grant.into_context(CredentialKind::Jwt, claims.jti.as_str()))
    }

    // Families are recorded under the refresh token kind; family ids and
    // token ids are both random UUIDs and never collide.
    async fn is_family_revoked(&self, family: &TokenId) -> bool {
        self.revocations
            .is_revoked(CredentialKind::RefreshToken, family.as_str())
            .await
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// On success `subject` is the token's owner. On reuse of a rotated token
    /// the family is revoked and the error is `Unauthorized`.
    pub async fn refresh(&self, raw: &str) -> Result<(SubjectId, TokenPair)> {
        self.refresh_at(raw, Utc::now()).await
    }

    pub async fn refresh_at(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<(SubjectId, TokenPair)> {
        let _exchange = self.refresh_lock.lock().await;

        let digest = digest_hex(raw);
        let mut record = self
            .load_refresh(&digest)
            .await?
            .ok_or_else(|| Error::unauthorized("unknown refresh token"))?;

        if self.is_family_revoked(&record.family).await {
            return Err(Error::unauthorized("refresh token family revoked"));
        }
        if record.revoked
            || self
                .revocations
                .is_revoked(CredentialKind::RefreshToken, record.id.as_str())
                .await
        {
            tracing::warn!(
                subject = %record.subject,
                family = %record.family,
                "refresh_token_reuse_detected"
            );
            self.revoke_family(&record.family).await?;
            return Err(Error::unauthorized("refresh token reuse"));
        }
        if record.is_expired_at(now) {
            self.storage.delete(REFRESH_TOKENS_NAMESPACE, &digest).await?;
            return Err(Error::unauthorized("refresh token expired"));
        }

        // Spend the presented token before minting its successor. The spent
        // flag lives on the record and goes away with it on purge.
        record.revoked = true;
        self.save_refresh(&digest, &record).await?;

        let subject = record.subject.clone();
        let grant = Grant {
            subject: record.subject,
            scopes: record.scopes,
            is_admin: record.is_admin,
        };
        let pair = self.mint(grant, record.family, now).await?;
        Ok((subject, pair))
    }

    /// Revoke one access token by its `jti`.
    pub async fn revoke_access(&self, jti: &str) -> Result<()> {
        self.revocations.revoke(CredentialKind::Jwt, jti).await
    }

    /// Revoke every access and refresh token minted in a family.
    pub async fn revoke_family(&self, family: &TokenId) -> Result<()> {
        self.revocations
            .revoke(CredentialKind::RefreshToken, family.as_str())
            .await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for (digest, value) in self.storage.scan(REFRESH_TOKENS_NAMESPACE).await? {
            let record: RefreshTokenRecord = serde_json::from_value(value)?;
            if record.is_expired_at(now) {
                self.storage.delete(REFRESH_TOKENS_NAMESPACE, &digest).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
