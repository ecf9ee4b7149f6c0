//! Runtime knobs, read from `KEEL_*` environment variables.

use std::time::Duration;

use keel_core::glob::match_any;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control namespace; bare application names resolve here.
    pub namespace: String,
    /// Globs of additional namespaces Applications may live in.
    pub app_namespaces: Vec<String>,
    /// When set, sub-resource checks ignore the application-level verb.
    pub disable_fine_grained_inheritance: bool,
    pub conflict_retries: usize,
    pub refresh_timeout: Duration,
    pub max_pod_logs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace: "argocd".into(),
            app_namespaces: Vec::new(),
            disable_fine_grained_inheritance: true,
            conflict_retries: 10,
            refresh_timeout: Duration::from_secs(30),
            max_pod_logs: 10,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> { std::env::var(key).ok().and_then(|s| s.trim().parse().ok()) }

impl ServerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let namespace = std::env::var("KEEL_NAMESPACE").ok().filter(|s| !s.trim().is_empty()).unwrap_or(d.namespace);
        let app_namespaces = std::env::var("KEEL_APP_NAMESPACES")
            .ok()
            .map(|s| split_list(&s))
            .unwrap_or(d.app_namespaces);
        Self {
            namespace,
            app_namespaces,
            disable_fine_grained_inheritance: env_parse("KEEL_DISABLE_APP_FINE_GRAINED_RBAC_INHERITANCE").unwrap_or(d.disable_fine_grained_inheritance),
            conflict_retries: env_parse("KEEL_CONFLICT_RETRIES").unwrap_or(d.conflict_retries),
            refresh_timeout: env_parse::<u64>("KEEL_REFRESH_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.refresh_timeout),
            max_pod_logs: env_parse("KEEL_MAX_POD_LOGS").unwrap_or(d.max_pod_logs),
        }
    }

    /// Control namespace or one of the enabled application namespaces.
    pub fn namespace_enabled(&self, ns: &str) -> bool { ns == self.namespace || match_any(&self.app_namespaces, ns) }
}

/// Comma-separated list, blanks dropped.
pub fn split_list(s: &str) -> Vec<String> { s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect() }
