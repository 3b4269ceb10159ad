//! Request context and scope-based authorization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::{Error, Result, SubjectId};

/// Set of granted or required scopes, e.g. `devices:write`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scopes(BTreeSet<String>);

impl Scopes {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, scope: impl Into<String>) -> bool {
        self.0.insert(scope.into())
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn is_superset(&self, other: &Scopes) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Scopes in `required` that `self` does not grant.
    pub fn missing(&self, required: &Scopes) -> Vec<String> {
        required.0.difference(&self.0).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S: Into<String>> FromIterator<S> for Scopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(" "))
    }
}

/// Which validator produced a [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Session,
    Jwt,
    RefreshToken,
}

impl CredentialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::ApiKey => "api_key",
            CredentialKind::Session => "session",
            CredentialKind::Jwt => "jwt",
            CredentialKind::RefreshToken => "refresh_token",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "api_key" => Some(CredentialKind::ApiKey),
            "session" => Some(CredentialKind::Session),
            "jwt" => Some(CredentialKind::Jwt),
            "refresh_token" => Some(CredentialKind::RefreshToken),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a new credential grants: identity, scopes and admin flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub subject: SubjectId,
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default)]
    pub is_admin: bool,
}

impl Grant {
    pub fn new(subject: SubjectId) -> Self {
        Self {
            subject,
            scopes: Scopes::new(),
            is_admin: false,
        }
    }

    pub fn with_scopes<S: Into<String>>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub(crate) fn into_context(
        self,
        source: CredentialKind,
        credential_id: impl Into<String>,
    ) -> RequestContext {
        RequestContext {
            subject: self.subject,
            scopes: self.scopes,
            is_admin: self.is_admin,
            source,
            credential_id: credential_id.into(),
        }
    }
}

/// Normalized result of authenticating a credential. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub subject: SubjectId,
    pub scopes: Scopes,
    pub is_admin: bool,
    pub source: CredentialKind,
    /// Id of the credential that was presented (key id, session id, token id).
    pub credential_id: String,
}

impl RequestContext {
    /// True iff the scopes cover `required` or the context is admin.
    pub fn can(&self, required: &Scopes) -> bool {
        self.is_admin || self.scopes.is_superset(required)
    }

    pub fn authorize(&self, required: &Scopes) -> Result<()> {
        if self.can(required) {
            return Ok(());
        }
        Err(Error::forbidden(format!(
            "subject {} lacks scopes: {}",
            self.subject,
            self.scopes.missing(required).join(", ")
        )))
    }
}
