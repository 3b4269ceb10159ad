//! Core types for the hub kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SessionId, SubscriptionId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for runtime, auth, storage and plugins

mod config;
mod errors;
mod ids;

pub use config::{
    AuthConfig, Config, ObservabilityConfig, PluginConfig, RuntimeConfig, StorageConfig,
};
pub use errors::{Error, ErrorKind, Result};
pub use ids::{CredentialId, SessionId, SubjectId, SubscriptionId, TokenId};
