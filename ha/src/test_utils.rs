//! In-process doubles for exercising controllers without a database or a
//! control plane: a scriptable engine, a store that injects failures, and a
//! cluster harness where every member shares one manual clock.

use crate::{
    adapter::DatabaseAdapter,
    controller::{ControllerConfig, HaController, TickOutcome},
    error::{Error, Result},
    lease::LeaseStore,
    record::{Annotations, ClusterRecord, Leader, RecordKeys, Switchover},
    retry::Backoff,
    storage::{InMemoryObjectStore, ObjectEvent, ObjectStore, StoredObject},
    time::ManualClock,
    topology::MemberTopology,
    Role,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const TEST_SYS_ID: &str = "7301954211083512231";
pub const TEST_TTL_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct FakeEngineState {
    pub running: bool,
    pub primary: bool,
    pub sys_id: String,
    pub op_time: i64,
    pub healthiest: bool,
    /// Returned by `process_manual_switchover_from_leader`; a hand-off also
    /// turns the engine into a replica.
    pub hand_off: bool,
    pub ready_for_switchover: bool,
    pub following: Option<String>,
    /// Times `handle_follow` actually re-pointed replication.
    pub follow_changes: usize,
    pub promotions: usize,
    /// Operations that fail with `EngineUnreachable`.
    pub failing: HashSet<&'static str>,
    /// Lifecycle operations that take this long before taking effect.
    pub delays: HashMap<&'static str, Duration>,
}

impl Default for FakeEngineState {
    fn default() -> Self {
        Self {
            running: true,
            primary: false,
            sys_id: TEST_SYS_ID.to_string(),
            op_time: 0,
            healthiest: true,
            hand_off: true,
            ready_for_switchover: true,
            following: None,
            follow_changes: 0,
            promotions: 0,
            failing: HashSet::new(),
            delays: HashMap::new(),
        }
    }
}

/// Scriptable engine that records how often each capability was invoked.
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<FakeEngineState>,
    calls: DashMap<&'static str, usize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary() -> Self {
        let engine = Self::new();
        engine.update(|s| s.primary = true);
        engine
    }

    pub fn state(&self) -> FakeEngineState {
        self.state.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut FakeEngineState)) {
        f(&mut self.state.lock());
    }

    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.state.lock().failing.remove(op);
    }

    /// Makes `op` sleep for `by` before it changes anything.
    pub fn slow(&self, op: &'static str, by: Duration) {
        self.state.lock().delays.insert(op, by);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.get(op).map_or(0, |count| *count)
    }

    pub fn reset_calls(&self) {
        self.calls.clear();
    }

    fn enter(&self, op: &'static str) -> Result<parking_lot::MutexGuard<'_, FakeEngineState>> {
        *self.calls.entry(op).or_insert(0) += 1;
        let state = self.state.lock();
        if state.failing.contains(op) {
            return Err(Error::EngineUnreachable(format!("{op} failed by test")));
        }
        Ok(state)
    }

    /// Like `enter`, but first sleeps for the configured delay without
    /// holding the state lock.
    async fn enter_slow(&self, op: &'static str) -> Result<parking_lot::MutexGuard<'_, FakeEngineState>> {
        let delay = self.enter(op)?.delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock())
    }
}

#[async_trait]
impl DatabaseAdapter for FakeEngine {
    fn engine(&self) -> &'static str {
        "fake"
    }

    async fn init_delay(&self) -> Result<()> {
        let state = self.enter("init_delay")?;
        if state.running {
            Ok(())
        } else {
            Err(Error::EngineUnreachable("engine down".into()))
        }
    }

    async fn is_leader(&self) -> Result<bool> {
        Ok(self.enter("is_leader")?.primary)
    }

    async fn is_running(&self, _member: &str) -> Result<bool> {
        Ok(self.enter("is_running")?.running)
    }

    async fn get_sys_id(&self) -> Result<String> {
        Ok(self.enter("get_sys_id")?.sys_id.clone())
    }

    async fn get_extra(&self) -> Result<BTreeMap<String, String>> {
        let state = self.enter("get_extra")?;
        let mut extra = BTreeMap::new();
        extra.insert("op_time".to_string(), state.op_time.to_string());
        Ok(extra)
    }

    async fn get_op_time(&self) -> Result<i64> {
        Ok(self.enter("get_op_time")?.op_time)
    }

    async fn start(&self, _member: &str) -> Result<()> {
        self.enter_slow("start").await?.running = true;
        Ok(())
    }

    async fn demote(&self, _member: &str) -> Result<()> {
        self.enter_slow("demote").await?.primary = false;
        Ok(())
    }

    async fn enforce_primary_role(&self, _member: &str) -> Result<()> {
        let mut state = self.enter_slow("enforce_primary_role").await?;
        if !state.primary {
            state.primary = true;
            state.following = None;
            state.promotions += 1;
        }
        Ok(())
    }

    async fn is_healthiest(&self, _member: &str, _cluster: &ClusterRecord) -> Result<bool> {
        Ok(self.enter("is_healthiest")?.healthiest)
    }

    async fn process_manual_switchover_from_leader(
        &self,
        _member: &str,
        _switchover: &Switchover,
    ) -> Result<bool> {
        let mut state = self.enter_slow("process_manual_switchover_from_leader").await?;
        if state.hand_off {
            state.primary = false;
        }
        Ok(state.hand_off)
    }

    async fn process_manual_switchover_from_no_leader(
        &self,
        _member: &str,
        _switchover: &Switchover,
    ) -> Result<bool> {
        Ok(self.enter("process_manual_switchover_from_no_leader")?.ready_for_switchover)
    }

    async fn handle_follow(&self, leader: Option<&Leader>, _member: &str) -> Result<()> {
        let mut state = self.enter("handle_follow")?;
        let target = leader.map(|l| l.name.clone());
        if target.is_some() && state.following != target {
            state.following = target;
            state.follow_changes += 1;
        }
        Ok(())
    }
}

/// Wraps a store and injects failures on demand.
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    update_conflicts: AtomicUsize,
    outage: AtomicBool,
    writes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            update_conflicts: AtomicUsize::new(0),
            outage: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// The next `n` updates fail with `Conflict` without reaching the store.
    pub fn inject_update_conflicts(&self, n: usize) {
        self.update_conflicts.store(n, Ordering::SeqCst);
    }

    /// While set, every call fails with `StoreUnavailable`.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Successful creates and updates made through this handle.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.outage.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    fn backend(&self) -> &'static str {
        "faulty"
    }

    async fn get(&self, name: &str) -> Result<Option<StoredObject>> {
        self.check()?;
        self.inner.get(name).await
    }

    async fn create(&self, name: &str, data: Annotations) -> Result<StoredObject> {
        self.check()?;
        let created = self.inner.create(name, data).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, name: &str, data: Annotations, version: &str) -> Result<StoredObject> {
        self.check()?;
        let injected = self
            .update_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Conflict { key: name.to_string() });
        }
        let updated = self.inner.update(name, data, version).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(name).await
    }

    async fn watch(&self, names: Vec<String>) -> Result<mpsc::UnboundedReceiver<ObjectEvent>> {
        self.check()?;
        self.inner.watch(names).await
    }
}

#[derive(Debug)]
pub struct TestMember {
    pub name: String,
    pub engine: Arc<FakeEngine>,
    pub store: Arc<FaultyStore>,
    pub lease: Arc<LeaseStore>,
    pub controller: Arc<HaController>,
}

pub fn test_config(member: &str, role: Role) -> ControllerConfig {
    ControllerConfig {
        member: member.to_string(),
        role,
        resync_interval: Duration::from_millis(20),
        grace_period: Duration::ZERO,
        call_timeout: Duration::from_millis(250),
        lifecycle_timeout: Duration::from_secs(1),
        renew_attempts: 3,
        startup_backoff: Backoff {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2,
            jitter: false,
        },
        topology: Arc::new(MemberTopology::default()),
    }
}

/// Members of one replica group sharing a store and a clock. Each member
/// has its own `FaultyStore` handle so it can be partitioned alone.
#[derive(Debug)]
pub struct TestCluster {
    pub objects: Arc<InMemoryObjectStore>,
    pub clock: Arc<ManualClock>,
    pub keys: RecordKeys,
    pub members: Vec<TestMember>,
}

impl TestCluster {
    pub fn new(names: &[&str]) -> Self {
        let mut cluster = Self {
            objects: Arc::new(InMemoryObjectStore::new()),
            clock: Arc::new(ManualClock::new()),
            keys: RecordKeys::new("pg", "postgresql"),
            members: Vec::new(),
        };
        for name in names {
            cluster.add_member(name, Role::Follower, FakeEngine::new());
        }
        cluster
    }

    pub fn ttl() -> chrono::Duration {
        chrono::Duration::seconds(TEST_TTL_SECS)
    }

    pub fn add_member(&mut self, name: &str, role: Role, engine: FakeEngine) -> &TestMember {
        self.add_member_with(test_config(name, role), engine)
    }

    /// Adds a member running under `config`; its name is `config.member`.
    pub fn add_member_with(&mut self, config: ControllerConfig, engine: FakeEngine) -> &TestMember {
        let name = config.member.clone();
        let engine = Arc::new(engine);
        let store = Arc::new(FaultyStore::new(self.objects.clone()));
        let lease = Arc::new(LeaseStore::new(
            store.clone(),
            self.keys.clone(),
            self.clock.clone(),
            Self::ttl(),
        ));
        let controller = Arc::new(HaController::new(config, lease.clone(), engine.clone()));
        self.members.push(TestMember {
            name,
            engine,
            store,
            lease,
            controller,
        });
        &self.members[self.members.len() - 1]
    }

    /// Panics on unknown names; only for tests.
    pub fn member(&self, name: &str) -> &TestMember {
        self.members
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("no member named {name}"))
    }

    pub async fn tick(&self, name: &str) -> Result<TickOutcome> {
        self.member(name).controller.reconcile().await
    }

    /// Ticks every member once, in insertion order.
    pub async fn tick_all(&self) -> Vec<(String, Result<TickOutcome>)> {
        let mut outcomes = Vec::with_capacity(self.members.len());
        for member in &self.members {
            outcomes.push((member.name.clone(), member.controller.reconcile().await));
        }
        outcomes
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    /// Record as stored, bypassing every member's cached view.
    pub async fn record(&self) -> Option<ClusterRecord> {
        let leader = self.objects.get(&self.keys.leader()).await.ok()??;
        let switchover = self.objects.get(&self.keys.switchover()).await.ok()?;
        ClusterRecord::from_annotations(&leader.data, switchover.as_ref().map(|s| &s.data), Self::ttl()).ok()
    }

    pub async fn recorded_leader(&self) -> Option<String> {
        self.record().await?.leader.map(|l| l.name)
    }

    /// Members whose engine currently accepts writes.
    pub fn primaries(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.engine.state().primary)
            .map(|m| m.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_engine_counts_calls() {
        let engine = FakeEngine::new();
        engine.enforce_primary_role("pod-0").await.unwrap();
        engine.enforce_primary_role("pod-0").await.unwrap();
        assert_eq!(engine.calls("enforce_primary_role"), 2);
        assert_eq!(engine.state().promotions, 1);

        engine.fail("is_leader");
        assert!(engine.is_leader().await.is_err());
        engine.heal("is_leader");
        assert!(engine.is_leader().await.unwrap());
    }

    #[tokio::test]
    async fn test_faulty_store_injects_conflicts() {
        let store = FaultyStore::new(Arc::new(InMemoryObjectStore::new()));
        let created = store.create("k", Annotations::new()).await.unwrap();
        store.inject_update_conflicts(1);

        let first = store.update("k", Annotations::new(), &created.version).await;
        assert!(matches!(first, Err(Error::Conflict { .. })));
        store.update("k", Annotations::new(), &created.version).await.unwrap();
        assert_eq!(store.writes(), 2);

        store.set_outage(true);
        assert!(matches!(store.get("k").await, Err(Error::StoreUnavailable(_))));
    }
}
