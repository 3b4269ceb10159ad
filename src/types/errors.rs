//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Boundary layers (HTTP, CLI) map
//! [`ErrorKind`] to their own status codes; the kernel never does.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the hub kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input to a service call or kernel operation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown service, plugin, subscription or credential.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing, expired or revoked credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but the request context lacks the required scopes.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Subject exhausted its token bucket.
    #[error("rate limited: subject {subject} may retry in {retry_after:?}")]
    RateLimited {
        subject: String,
        retry_after: Duration,
    },

    /// Service name already held by another live owner.
    #[error("service {name} already registered by {owner}")]
    DuplicateService { name: String, owner: String },

    /// A plugin lifecycle hook failed.
    #[error("plugin {plugin} failed: {reason}")]
    PluginFailure { plugin: String, reason: String },

    /// A service handler returned an error.
    #[error("service {name} failed: {cause}")]
    Service { name: String, cause: Box<Error> },

    /// Storage or vendor call failure. `status` carries an upstream status
    /// code (for example 401) when one is known.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// Illegal lifecycle transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// A bounded operation exceeded its budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, payload-free classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    DuplicateService,
    PluginFailure,
    Service,
    Transport,
    StateTransition,
    Timeout,
    Config,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Serialization(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::DuplicateService { .. } => ErrorKind::DuplicateService,
            Error::PluginFailure { .. } => ErrorKind::PluginFailure,
            Error::Service { .. } => ErrorKind::Service,
            Error::Transport { .. } | Error::Io(_) => ErrorKind::Transport,
            Error::StateTransition(_) => ErrorKind::StateTransition,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the caller should re-authenticate before retrying.
    ///
    /// Looks through [`Error::Service`] wrappers to the handler's cause.
    pub fn requires_reauth(&self) -> bool {
        match self {
            Error::Unauthorized(_) => true,
            Error::Transport { status, .. } => *status == Some(401),
            Error::Service { cause, .. } => cause.requires_reauth(),
            _ => false,
        }
    }

    /// Innermost cause, unwrapping nested service errors.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Service { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn rate_limited(subject: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            subject: subject.into(),
            retry_after,
        }
    }

    pub fn duplicate_service(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::DuplicateService {
            name: name.into(),
            owner: owner.into(),
        }
    }

    pub fn plugin_failure(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginFailure {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn service(name: impl Into<String>, cause: Error) -> Self {
        Self::Service {
            name: name.into(),
            cause: Box::new(cause),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            status: None,
        }
    }

    pub fn transport_with_status(msg: impl Into<String>, status: u16) -> Self {
        Self::Transport {
            message: msg.into(),
            status: Some(status),
        }
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
