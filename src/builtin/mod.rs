//! Built-in plugins shipped with the kernel.
//!
//! - `system`: `system.ping`, `system.plugins` (admin only), `system.services`
//! - `state`: `state.get`, `state.set`, `state.delete`, `state.keys`

pub mod state;
pub mod system;

pub use state::{StatePlugin, StateSettings, STATE_CHANGED_TOPIC};
pub use system::SystemPlugin;

use crate::plugin::PluginCatalog;

/// Catalog holding every built-in kind.
pub fn catalog() -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog
        .register(system::KIND, system::factory)
        .register(state::KIND, state::factory);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, CredentialKind, Grant, RequestContext};
    use crate::bus::handler_fn;
    use crate::kernel::{PluginState, Runtime};
    use crate::storage::MemoryStorage;
    use crate::types::{Config, ErrorKind, PluginConfig, SubjectId};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn entry(kind: &str, settings: Value) -> PluginConfig {
        PluginConfig {
            kind: kind.to_string(),
            name: None,
            enabled: true,
            settings,
        }
    }

    async fn runtime() -> Arc<Runtime> {
        let mut config = Config::default();
        config.plugins = vec![
            entry("system", Value::Null),
            entry("state", json!({"default_namespace": "home"})),
        ];
        let rt = Runtime::boot(config, Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        let report = rt.load_configured(&catalog()).await.unwrap();
        assert!(report.is_clean(), "{:?}", report);
        rt
    }

    fn context(admin: bool, scopes: &[&str]) -> RequestContext {
        let mut grant = Grant::new(SubjectId::must("carol")).with_scopes(scopes.iter().copied());
        if admin {
            grant = grant.admin();
        }
        grant.into_context(CredentialKind::Session, "test".to_string())
    }

    #[test]
    fn test_catalog_kinds() {
        assert_eq!(catalog().kinds(), vec!["state", "system"]);
    }

    #[tokio::test]
    async fn test_system_ping_and_services() {
        let rt = runtime().await;
        let pong = rt.services().call("system.ping", Value::Null).await.unwrap();
        assert_eq!(pong["pong"], json!(true));

        let listed = rt
            .services()
            .call("system.services", Value::Null)
            .await
            .unwrap();
        let names: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|s| s["name"].as_str())
            .collect();
        assert!(names.contains(&"state.set"));
        assert!(names.contains(&"system.ping"));
    }

    #[tokio::test]
    async fn test_system_plugins_is_admin_only() {
        let rt = runtime().await;

        let err = rt
            .services()
            .call_as(&context(false, &[]), "system.plugins", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.root_cause().kind(), ErrorKind::Forbidden);

        let infos = rt
            .services()
            .call_as(&context(true, &[]), "system.plugins", Value::Null)
            .await
            .unwrap();
        let states: Vec<(&str, &str)> = infos
            .as_array()
            .unwrap()
            .iter()
            .map(|i| (i["name"].as_str().unwrap(), i["state"].as_str().unwrap()))
            .collect();
        assert_eq!(states, vec![("system", "started"), ("state", "started")]);
    }

    #[tokio::test]
    async fn test_state_set_persists_then_announces() {
        let rt = runtime().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rt.bus()
            .subscribe(
                STATE_CHANGED_TOPIC,
                handler_fn(move |event| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(event.payload().clone());
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let writer = context(false, &["state:write", "state:read"]);
        let reply = rt
            .services()
            .call_as(&writer, "state.set", json!({"key": "lamp", "value": {"on": true}}))
            .await
            .unwrap();
        let generation = reply["generation"].as_u64().unwrap();

        assert_eq!(
            rt.state().get("home", "lamp").await.unwrap(),
            Some(json!({"on": true}))
        );
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![json!({"namespace": "home", "key": "lamp", "generation": generation})]
        );

        let got = rt
            .services()
            .call_as(&writer, "state.get", json!({"key": "lamp"}))
            .await
            .unwrap();
        assert_eq!(got["value"], json!({"on": true}));
        assert_eq!(got["generation"], json!(generation));

        let keys = rt
            .services()
            .call("state.keys", json!({"namespace": "home"}))
            .await
            .unwrap();
        assert_eq!(keys, json!(["lamp"]));
    }

    #[tokio::test]
    async fn test_state_requires_scopes_and_valid_args() {
        let rt = runtime().await;
        let reader = context(false, &["state:read"]);
        let err = rt
            .services()
            .call_as(&reader, "state.set", json!({"key": "k", "value": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = rt
            .services()
            .call("state.get", json!({"nope": true}))
            .await
            .unwrap_err();
        assert_eq!(err.root_cause().kind(), ErrorKind::Validation);

        let missing = rt
            .services()
            .call("state.get", json!({"key": "absent"}))
            .await
            .unwrap();
        assert_eq!(missing, json!({"value": null, "generation": null}));
    }

    #[tokio::test]
    async fn test_bad_state_settings_fail_only_that_plugin() {
        let mut config = Config::default();
        config.plugins = vec![
            entry("system", Value::Null),
            entry("state", json!({"hydrate": "not-a-list"})),
        ];
        let rt = Runtime::boot(config, Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        let report = rt.load_configured(&catalog()).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(rt.plugins().state("state").await, Some(PluginState::Failed));
        assert_eq!(
            rt.plugins().state("system").await,
            Some(PluginState::Started)
        );
    }

    #[tokio::test]
    async fn test_state_services_cannot_reach_auth_namespaces() {
        let rt = runtime().await;
        rt.auth()
            .create_session(Grant::new(SubjectId::must("alice")).admin())
            .await
            .unwrap();
        let mallory = rt
            .auth()
            .create_session(
                Grant::new(SubjectId::must("mallory")).with_scopes(["state:read", "state:write"]),
            )
            .await
            .unwrap();
        let mallory = Credential::Session(mallory.id.to_string());

        // Leave something in the audit trail first.
        rt.call_external(&mallory, "system.ping", Value::Null)
            .await
            .unwrap();
        let audit_before = rt.storage().list("auth.audit").await.unwrap();
        assert!(!audit_before.is_empty());

        let calls = [
            ("state.keys", json!({"namespace": "auth.sessions"})),
            ("state.get", json!({"namespace": "auth.api_keys", "key": "x"})),
            (
                "state.set",
                json!({
                    "namespace": "auth.sessions",
                    "key": "forged",
                    "value": {"id": "forged", "subject": "mallory", "is_admin": true},
                }),
            ),
            (
                "state.delete",
                json!({"namespace": "auth.audit", "key": audit_before[0]}),
            ),
            ("state.delete", json!({"namespace": "auth.revocations", "key": "x"})),
        ];
        for (service, args) in calls {
            let err = rt
                .call_external(&mallory, service, args)
                .await
                .unwrap_err();
            assert_eq!(err.root_cause().kind(), ErrorKind::Forbidden, "{}", service);
        }

        assert!(rt
            .storage()
            .get("auth.sessions", "forged")
            .await
            .unwrap()
            .is_none());
        let audit_after = rt.storage().list("auth.audit").await.unwrap();
        assert!(audit_before.iter().all(|key| audit_after.contains(key)));
    }
}
