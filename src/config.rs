//! Agent configuration.
//!
//! Read from a TOML file, then overridden from the pod environment:
//!
//! ```toml
//! [member]
//! pod_name = "pg-main-0"
//! cluster = "pg"
//! component = "postgresql"
//!
//! [lease]
//! ttl = "15s"
//! resync_period = "5s"
//!
//! [store]
//! backend = "kubernetes"
//!
//! [engine]
//! type = "postgresql"
//! [engine.properties]
//! url = "host=localhost user=postgres"
//! ```

use ha::{
    kube::KubeConfig,
    retry::Backoff,
    topology::MemberTopology,
    ControllerConfig, EngineConfig, RecordKeys, Role,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_DB_TYPE: &str = "HA_DB_TYPE";
pub const ENV_CLUSTER: &str = "HA_CLUSTER";
pub const ENV_COMPONENT: &str = "HA_COMPONENT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub member: MemberConfig,
    pub lease: LeaseConfig,
    pub store: StoreConfig,
    pub engine: EngineSection,
    pub topology: MemberTopology,
    pub server: ServerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    pub pod_name: String,
    pub namespace: String,
    pub cluster: String,
    pub component: String,
    /// `follower` or `learner`; leadership is never configured statically.
    pub role: Role,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            pod_name: String::new(),
            namespace: "default".to_string(),
            cluster: String::new(),
            component: String::new(),
            role: Role::Follower,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Deadline for engine start, demotion, promotion and hand-off.
    #[serde(with = "humantime_serde")]
    pub lifecycle_timeout: Duration,
    pub renew_attempts: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            resync_period: Duration::from_secs(5),
            grace_period: Duration::from_secs(1),
            call_timeout: Duration::from_secs(3),
            lifecycle_timeout: Duration::from_secs(90),
            renew_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Kubernetes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Defaults to the in-cluster API server address.
    pub api_url: Option<String>,
    pub token_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub labels: BTreeMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Kubernetes,
            api_url: None,
            token_path: None,
            ca_path: None,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(5),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([0, 0, 0, 0], 3501)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl Config {
    /// Loads `path` if given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Non-empty variables win over file values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(pod_name) = get(ENV_POD_NAME) {
            self.member.pod_name = pod_name;
        }
        if let Some(namespace) = get(ENV_POD_NAMESPACE) {
            self.member.namespace = namespace;
        }
        if let Some(cluster) = get(ENV_CLUSTER) {
            self.member.cluster = cluster;
        }
        if let Some(component) = get(ENV_COMPONENT) {
            self.member.component = component;
        }
        if let Some(kind) = get(ENV_DB_TYPE) {
            self.engine.kind = kind;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (field, value) in [
            ("member.pod_name", &self.member.pod_name),
            ("member.cluster", &self.member.cluster),
            ("member.component", &self.member.component),
            ("engine.type", &self.engine.kind),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("{field} must be set"));
            }
        }
        if self.member.role == Role::Leader {
            return invalid("member.role must be follower or learner".into());
        }

        let lease = &self.lease;
        if lease.ttl < Duration::from_secs(2) || lease.ttl.subsec_millis() != 0 {
            return invalid(format!(
                "lease.ttl must be a whole number of seconds, at least 2s, got {:?}",
                lease.ttl
            ));
        }
        if lease.resync_period.is_zero() || lease.resync_period >= lease.ttl {
            return invalid("lease.resync_period must be positive and shorter than lease.ttl".into());
        }
        if lease.call_timeout.is_zero() || lease.call_timeout >= lease.ttl {
            return invalid("lease.call_timeout must be positive and shorter than lease.ttl".into());
        }
        if lease.lifecycle_timeout < lease.call_timeout {
            return invalid("lease.lifecycle_timeout must not be shorter than lease.call_timeout".into());
        }
        if lease.renew_attempts == 0 {
            return invalid("lease.renew_attempts must be at least 1".into());
        }

        self.topology
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn record_keys(&self) -> RecordKeys {
        RecordKeys::new(&self.member.cluster, &self.member.component)
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease.ttl.as_secs()).unwrap_or(i64::MAX))
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            member: self.member.pod_name.clone(),
            role: self.member.role,
            resync_interval: self.lease.resync_period,
            grace_period: self.lease.grace_period,
            call_timeout: self.lease.call_timeout,
            lifecycle_timeout: self.lease.lifecycle_timeout,
            renew_attempts: self.lease.renew_attempts,
            startup_backoff: Backoff::default(),
            topology: Arc::new(self.topology.clone()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            member: self.member.pod_name.clone(),
            properties: self.engine.properties.clone(),
        }
    }

    pub fn kube_config(&self) -> ha::Result<KubeConfig> {
        let mut kube = match &self.store.api_url {
            Some(api_url) => KubeConfig {
                api_url: api_url.clone(),
                namespace: self.member.namespace.clone(),
                token_path: None,
                ca_path: None,
                accept_invalid_certs: false,
                request_timeout: self.store.request_timeout,
                poll_interval: self.lease.resync_period,
                labels: BTreeMap::new(),
            },
            None => KubeConfig::in_cluster(&self.member.namespace)?,
        };
        if self.store.token_path.is_some() {
            kube.token_path = self.store.token_path.clone();
        }
        if self.store.ca_path.is_some() {
            kube.ca_path = self.store.ca_path.clone();
        }
        kube.accept_invalid_certs = self.store.accept_invalid_certs;
        kube.request_timeout = self.store.request_timeout;
        kube.poll_interval = self.lease.resync_period;
        kube.labels = self.store.labels.clone();
        kube.labels
            .entry("app.kubernetes.io/instance".to_string())
            .or_insert_with(|| self.member.cluster.clone());
        kube.labels
            .entry("app.kubernetes.io/component".to_string())
            .or_insert_with(|| self.member.component.clone());
        Ok(kube)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha::topology::UpdateStrategy;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        [member]
        pod_name = "pg-main-1"
        cluster = "pg"
        component = "postgresql"

        [lease]
        ttl = "20s"
        resync_period = "2s"
        grace_period = "500ms"
        lifecycle_timeout = "2m"

        [store]
        backend = "memory"

        [engine]
        type = "postgresql"
        [engine.properties]
        url = "host=localhost user=postgres"

        [topology]
        update_strategy = "best-effort-parallel"

        [server]
        bind = "127.0.0.1:9000"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.member.pod_name, "pg-main-1");
        assert_eq!(config.member.namespace, "default");
        assert_eq!(config.lease.ttl, Duration::from_secs(20));
        assert_eq!(config.lease.grace_period, Duration::from_millis(500));
        assert_eq!(config.lease.call_timeout, Duration::from_secs(3));
        assert_eq!(config.lease.lifecycle_timeout, Duration::from_secs(120));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.engine.properties["url"], "host=localhost user=postgres");
        assert_eq!(config.server.bind, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.record_keys().leader(), "pg-postgresql-leader");
        assert_eq!(config.ttl(), chrono::Duration::seconds(20));

        let controller = config.controller_config();
        assert_eq!(controller.member, "pg-main-1");
        assert_eq!(controller.resync_interval, Duration::from_secs(2));
        assert_eq!(controller.lifecycle_timeout, Duration::from_secs(120));
        assert_eq!(controller.topology.update_strategy, UpdateStrategy::BestEffortParallel);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_POD_NAME, "pg-main-2"),
            (ENV_POD_NAMESPACE, "db"),
            (ENV_DB_TYPE, "mysql"),
            (ENV_CLUSTER, ""),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.member.pod_name, "pg-main-2");
        assert_eq!(config.member.namespace, "db");
        assert_eq!(config.engine.kind, "mysql");
        assert_eq!(config.member.cluster, "pg");
    }

    #[test]
    fn test_validation_errors() {
        let base = Config::from_toml_str(SAMPLE).unwrap();

        let mut missing_pod = base.clone();
        missing_pod.member.pod_name.clear();
        assert!(matches!(missing_pod.validate(), Err(ConfigError::Invalid(m)) if m.contains("pod_name")));

        let mut leader_role = base.clone();
        leader_role.member.role = Role::Leader;
        assert!(leader_role.validate().is_err());

        let mut slow_resync = base.clone();
        slow_resync.lease.resync_period = Duration::from_secs(30);
        assert!(slow_resync.validate().is_err());

        let mut fractional_ttl = base.clone();
        fractional_ttl.lease.ttl = Duration::from_millis(2500);
        assert!(fractional_ttl.validate().is_err());

        let mut hasty_lifecycle = base.clone();
        hasty_lifecycle.lease.lifecycle_timeout = Duration::from_secs(1);
        assert!(hasty_lifecycle.validate().is_err());

        let mut bad_topology = base;
        bad_topology.topology.leader.replicas = 2;
        assert!(bad_topology.validate().is_err());
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = Config::from_toml_str("[lease]\nttl = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overflowing_duration_is_parse_error() {
        let err = Config::from_toml_str("[lease]\nttl = \"99999999999999999999s\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let err = Config::from_toml_str("[lease]\nttl = \"18446744073709551615m\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_durations_serialize_readably() {
        let rendered = toml::to_string(&LeaseConfig::default()).unwrap();
        assert!(rendered.contains("ttl = \"15s\""), "{rendered}");
        assert!(rendered.contains("lifecycle_timeout = \"1m 30s\""), "{rendered}");
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hapod.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.member.component, "postgresql");

        let missing = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_explicit_api_url_skips_in_cluster_lookup() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.store.api_url = Some("https://127.0.0.1:6443".into());
        config.store.token_path = Some(PathBuf::from("/tmp/token"));

        let kube = config.kube_config().unwrap();
        assert_eq!(kube.api_url, "https://127.0.0.1:6443");
        assert_eq!(kube.token_path, Some(PathBuf::from("/tmp/token")));
        assert_eq!(kube.poll_interval, Duration::from_secs(2));
        assert_eq!(kube.labels["app.kubernetes.io/instance"], "pg");
    }
}
