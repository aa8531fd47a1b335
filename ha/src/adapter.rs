//! The capability set every database engine plugs in through.

use crate::{
    error::{Error, Result},
    record::{ClusterRecord, Leader, Switchover},
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Engine-specific role, health and promotion operations.
///
/// Implementations fail fast and never retry on their own; the controller
/// wraps every call in a deadline and owns the retry policy. Use
/// `Error::EngineUnreachable` for connectivity problems, `Error::EngineState`
/// for engine states the caller must not act on, and `Error::Unsupported`
/// for capabilities the engine lacks.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync + fmt::Debug {
    fn engine(&self) -> &'static str;

    /// Startup probe: succeeds once the engine accepts connections.
    async fn init_delay(&self) -> Result<()>;

    /// Whether the local engine currently acts as the writable primary.
    async fn is_leader(&self) -> Result<bool>;

    async fn is_running(&self, member: &str) -> Result<bool>;

    /// Identity of the database instance set, shared by a primary and its replicas.
    async fn get_sys_id(&self) -> Result<String>;

    /// Engine metadata stored with the lease, e.g. timeline or replication position.
    async fn get_extra(&self) -> Result<BTreeMap<String, String>>;

    /// Monotonic progress counter used to rank candidates.
    async fn get_op_time(&self) -> Result<i64>;

    async fn start(&self, member: &str) -> Result<()>;

    async fn demote(&self, member: &str) -> Result<()>;

    /// Promotes the local engine if needed. Must be a no-op on a primary.
    async fn enforce_primary_role(&self, member: &str) -> Result<()>;

    /// Engine-native comparison of local progress against the other members.
    async fn is_healthiest(&self, member: &str, cluster: &ClusterRecord) -> Result<bool>;

    /// Called on the leader while a switchover is pending. Returns `true`
    /// once the local engine has handed off and no longer acts as primary.
    async fn process_manual_switchover_from_leader(
        &self,
        member: &str,
        switchover: &Switchover,
    ) -> Result<bool>;

    /// Called on the chosen candidate while the group has no leader and a
    /// switchover is pending. Returns `true` when it is ready to be promoted.
    async fn process_manual_switchover_from_no_leader(
        &self,
        member: &str,
        switchover: &Switchover,
    ) -> Result<bool>;

    /// Attaches the local engine as a replica of `leader`. Must be a no-op
    /// when already following it; `None` means there is nobody to follow.
    async fn handle_follow(&self, leader: Option<&Leader>, member: &str) -> Result<()>;
}

/// Engine settings handed to constructors: free-form properties from the
/// configuration file.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub member: String,
    pub properties: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.property(key)
            .ok_or_else(|| Error::Config(format!("engine property {key:?} is required")))
    }
}

pub type AdapterConstructor = fn(&EngineConfig) -> Result<Arc<dyn DatabaseAdapter>>;

/// Maps engine type identifiers to adapter constructors.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    constructors: HashMap<String, AdapterConstructor>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("engines", &self.engines())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every engine this crate ships.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(crate::engine::postgres::ENGINE, crate::engine::postgres::construct);
        registry
    }

    pub fn register(&mut self, engine: &str, constructor: AdapterConstructor) {
        self.constructors.insert(engine.to_ascii_lowercase(), constructor);
    }

    pub fn engines(&self) -> Vec<String> {
        let mut engines: Vec<String> = self.constructors.keys().cloned().collect();
        engines.sort();
        engines
    }

    /// Unknown engines are a configuration error, reported before any
    /// reconciliation starts.
    pub fn build(&self, engine: &str, config: &EngineConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        let constructor = self.constructors.get(&engine.to_ascii_lowercase()).ok_or_else(|| {
            Error::Config(format!(
                "unknown database engine {engine:?}, known engines: {}",
                self.engines().join(", ")
            ))
        })?;
        constructor(config)
    }
}
