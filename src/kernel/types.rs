//! Kernel types: PluginState, PluginInfo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::SubscriptionId;

/// Plugin lifecycle state.
///
/// State transitions:
/// ```text
/// UNLOADED → LOADING → LOADED → STARTING → STARTED → STOPPING → STOPPED
///               ↓         ↓         ↓          ↓          ↓
///             FAILED    FAILED    FAILED     FAILED     FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loading,
    Loaded,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

impl PluginState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, PluginState::Stopped | PluginState::Failed)
    }

    /// Check if the plugin may hold services and subscriptions.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PluginState::Loading
                | PluginState::Loaded
                | PluginState::Starting
                | PluginState::Started
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: PluginState) -> bool {
        match (self, to) {
            (PluginState::Unloaded, PluginState::Loading) => true,
            (PluginState::Loading, PluginState::Loaded) => true,
            (PluginState::Loaded, PluginState::Starting) => true,
            (PluginState::Starting, PluginState::Started) => true,
            (PluginState::Started, PluginState::Stopping) => true,
            (PluginState::Stopping, PluginState::Stopped) => true,
            // A loaded plugin that never started may be stopped directly.
            (PluginState::Loaded, PluginState::Stopping) => true,
            // Any non-terminal phase may fail.
            (from, PluginState::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Starting => "starting",
            PluginState::Started => "started",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Failed => "failed",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PluginState,
    pub to: PluginState,
    pub at: DateTime<Utc>,
}

/// Snapshot of a plugin record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub kind: String,
    pub version: String,
    pub state: PluginState,
    /// Every transition since `Unloaded`, oldest first.
    pub history: Vec<StateTransition>,
    /// Service names currently owned.
    pub services: Vec<String>,
    /// Subscriptions currently owned.
    pub subscriptions: Vec<SubscriptionId>,
    pub last_error: Option<String>,
    pub loaded_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl PluginInfo {
    /// True if the plugin passed through `state` at some point.
    pub fn passed_through(&self, state: PluginState) -> bool {
        self.history.iter().any(|t| t.to == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PluginState; 8] = [
        PluginState::Unloaded,
        PluginState::Loading,
        PluginState::Loaded,
        PluginState::Starting,
        PluginState::Started,
        PluginState::Stopping,
        PluginState::Stopped,
        PluginState::Failed,
    ];

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            PluginState::Unloaded,
            PluginState::Loading,
            PluginState::Loaded,
            PluginState::Starting,
            PluginState::Started,
            PluginState::Stopping,
            PluginState::Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_started_requires_starting() {
        for from in ALL {
            let allowed = from.can_transition_to(PluginState::Started);
            assert_eq!(allowed, from == PluginState::Starting, "from {}", from);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in [PluginState::Stopped, PluginState::Failed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_any_live_phase_can_fail() {
        for from in ALL.iter().copied().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(PluginState::Failed));
        }
    }

    #[test]
    fn test_no_skipping() {
        assert!(!PluginState::Unloaded.can_transition_to(PluginState::Loaded));
        assert!(!PluginState::Loading.can_transition_to(PluginState::Starting));
        assert!(!PluginState::Started.can_transition_to(PluginState::Stopped));
        assert!(!PluginState::Started.can_transition_to(PluginState::Loaded));
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&PluginState::Started).unwrap(),
            "\"started\""
        );
    }
}
