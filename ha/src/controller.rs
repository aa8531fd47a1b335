//! Per-member reconciliation loop.
//!
//! Each tick re-reads the lease record, then drives the local engine toward
//! the role the record assigns it. Members never talk to each other; the only
//! cross-member serialization is the compare-and-swap on the record.

use crate::{
    adapter::DatabaseAdapter,
    error::{Error, Result},
    event::{watch_lease, LeaseEvent},
    lease::{LeaseSnapshot, LeaseStore},
    record::{ClusterRecord, Leader, Switchover},
    retry::{bounded, Backoff},
    time::Timestamp,
    topology::MemberTopology,
    Role,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub member: String,
    /// Configured role of this member; learners never contend for the lease.
    pub role: Role,
    /// Fallback tick period when no lease event arrives.
    pub resync_interval: Duration,
    /// Wait after an election this member did not win, before following.
    pub grace_period: Duration,
    /// Deadline for every single adapter or store call.
    pub call_timeout: Duration,
    /// Deadline for engine lifecycle changes (start, demote, promote,
    /// hand-off), which may restart the database.
    pub lifecycle_timeout: Duration,
    pub renew_attempts: u32,
    pub startup_backoff: Backoff,
    pub topology: Arc<MemberTopology>,
}

impl ControllerConfig {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            role: Role::Follower,
            resync_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(1),
            call_timeout: Duration::from_secs(3),
            lifecycle_timeout: Duration::from_secs(90),
            renew_attempts: 3,
            startup_backoff: Backoff::default(),
            topology: Arc::new(MemberTopology::default()),
        }
    }
}

/// What a single reconciliation tick ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// The engine was down and a start was issued.
    Started,
    Renewed,
    Acquired,
    /// Leadership was handed to a switchover candidate.
    SwitchedOver,
    /// The engine did not finish handing off in time. The lease is not
    /// renewed and the hand-off is retried next tick.
    HandingOff,
    /// Renewal failed; the local engine was demoted.
    LockLost,
    Following { leader: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemberStatus {
    pub member: String,
    pub role: Option<Role>,
    pub leader: Option<String>,
    pub lease_valid_until: Option<Timestamp>,
    pub last_tick: Option<Timestamp>,
    pub last_outcome: Option<TickOutcome>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct LocalState {
    /// Expiry of the lease this member last wrote for itself.
    lease_valid_until: Option<Timestamp>,
    leader: Option<String>,
    last_tick: Option<Timestamp>,
    last_outcome: Option<TickOutcome>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct HaController {
    config: ControllerConfig,
    store: Arc<LeaseStore>,
    adapter: Arc<dyn DatabaseAdapter>,
    state: RwLock<LocalState>,
}

impl HaController {
    pub fn new(config: ControllerConfig, store: Arc<LeaseStore>, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            config,
            store,
            adapter,
            state: RwLock::new(LocalState::default()),
        }
    }

    pub fn member(&self) -> &str {
        &self.config.member
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    /// Whether this member holds an unexpired lease it wrote itself.
    pub fn holds_lease(&self) -> bool {
        let now = self.store.now();
        self.state.read().lease_valid_until.is_some_and(|until| now <= until)
    }

    pub fn status(&self) -> MemberStatus {
        let role = if self.holds_lease() {
            Role::Leader
        } else {
            self.config.role
        };
        let state = self.state.read();
        MemberStatus {
            member: self.config.member.clone(),
            role: state.last_tick.map(|_| role),
            leader: state.leader.clone(),
            lease_valid_until: state.lease_valid_until,
            last_tick: state.last_tick,
            last_outcome: state.last_outcome.clone(),
            last_error: state.last_error.clone(),
        }
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(op, self.config.call_timeout, fut).await
    }

    async fn lifecycle<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(op, self.config.lifecycle_timeout, fut).await
    }

    /// Non-critical engine queries fall back to a pessimistic default.
    async fn query_or<T, F>(&self, op: &'static str, fut: F, default: T) -> T
    where
        F: Future<Output = Result<T>>,
    {
        match self.call(op, fut).await {
            Ok(value) => value,
            Err(e) => {
                debug!(member = %self.config.member, op, error = %e, "Engine query failed, using default");
                default
            }
        }
    }

    fn set_lease(&self, snapshot: &LeaseSnapshot) {
        let mut state = self.state.write();
        state.lease_valid_until = snapshot.record.leader.as_ref().map(Leader::expires_at);
        state.leader = Some(self.config.member.clone());
    }

    /// Probes the engine and seeds or joins the lease record.
    pub async fn init(&self) -> Result<LeaseSnapshot> {
        let member = self.config.member.as_str();
        let backoff = &self.config.startup_backoff;

        if let Err(e) = backoff
            .retry("init_delay", |_| self.call("init_delay", self.adapter.init_delay()))
            .await
        {
            warn!(member, error = %e, "Engine not ready at startup");
        }

        let reported_leader = match backoff
            .retry("is_leader", |_| self.call("is_leader", self.adapter.is_leader()))
            .await
        {
            Ok(is_leader) => is_leader,
            Err(e) => {
                warn!(member, error = %e, "Could not determine engine role, assuming replica");
                false
            }
        };
        let is_leader = reported_leader && self.config.topology.can_lead(self.config.role);

        if is_leader && !self.query_or("is_running", self.adapter.is_running(member), false).await {
            return Err(Error::EngineState(format!(
                "{member} reports the primary role but its engine is not running"
            )));
        }

        let sys_id = self.query_or("get_sys_id", self.adapter.get_sys_id(), String::new()).await;
        let extra = self.query_or("get_extra", self.adapter.get_extra(), BTreeMap::new()).await;
        let op_time = self.query_or("get_op_time", self.adapter.get_op_time(), 0).await;

        let snapshot = self
            .call(
                "init",
                self.store.init(is_leader, &sys_id, extra, op_time, member, self.config.role),
            )
            .await?;

        if is_leader && snapshot.record.leader_name() == Some(member) {
            self.set_lease(&snapshot);
        }
        info!(
            member,
            engine = self.adapter.engine(),
            is_leader,
            leader = ?snapshot.record.leader_name(),
            "Joined replica group"
        );
        Ok(snapshot)
    }

    /// Repeats [`init`](Self::init) with backoff until it succeeds or fails
    /// fatally.
    pub async fn join(&self) -> Result<LeaseSnapshot> {
        let member = self.config.member.as_str();
        let mut attempt = 0;
        loop {
            match self.init().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let delay = self.config.startup_backoff.delay_for(attempt);
                    warn!(
                        member,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Could not join replica group, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One reconciliation pass. Store failures abort the tick before any
    /// role change. The outcome is kept for [`status`](Self::status).
    pub async fn reconcile(&self) -> Result<TickOutcome> {
        let result = self.tick().await;
        self.record_outcome(&result);
        result
    }

    async fn tick(&self) -> Result<TickOutcome> {
        let member = self.config.member.as_str();
        let mut snapshot = self.call("refresh", self.store.refresh()).await?;

        if !self.query_or("is_running", self.adapter.is_running(member), false).await {
            info!(member, "Engine not running, starting it");
            self.lifecycle("start", self.adapter.start(member)).await?;
            return Ok(TickOutcome::Started);
        }

        let op_time = self.query_or("get_op_time", self.adapter.get_op_time(), 0).await;
        match self
            .call("register_member", self.store.register_member(member, self.config.role, op_time))
            .await
        {
            Ok(registered) => snapshot = registered,
            Err(e) if e.is_conflict() => {
                debug!(member, "Registration raced another writer, re-reading");
                snapshot = self.call("refresh", self.store.refresh()).await?;
            }
            Err(e) => return Err(e),
        }

        let now = self.store.now();
        match snapshot.record.valid_leader(&now).cloned() {
            Some(leader) if leader.name == member => self.lead(&snapshot.record, &now).await,
            Some(leader) => self.follow(Some(&leader)).await,
            None => self.elect(&snapshot.record, &now).await,
        }
    }

    async fn lead(&self, record: &ClusterRecord, now: &Timestamp) -> Result<TickOutcome> {
        let member = self.config.member.as_str();

        // Set when a hand-off failed midway and the engine role is unknown.
        let mut hand_off_failed = false;
        if let Some(switchover) = &record.switchover {
            match record.switchover_candidate(now) {
                Some(candidate) if candidate != member => {
                    match self
                        .lifecycle(
                            "process_manual_switchover_from_leader",
                            self.adapter.process_manual_switchover_from_leader(member, switchover),
                        )
                        .await
                    {
                        Ok(true) => return Ok(self.hand_off(switchover, candidate).await),
                        Ok(false) => debug!(member, candidate, "Switchover pending, engine not ready to hand off"),
                        Err(e @ Error::Timeout { .. }) => {
                            warn!(member, candidate, error = %e, "Hand-off still running, lease left to expire");
                            return Ok(TickOutcome::HandingOff);
                        }
                        Err(e) => {
                            warn!(member, candidate, error = %e, "Hand-off failed");
                            hand_off_failed = true;
                        }
                    }
                }
                Some(_) => {
                    info!(member, "Discarding switchover that names the current leader");
                    self.clear_switchover().await;
                }
                None => debug!(member, "Switchover pending, no candidate available yet"),
            }
        }

        let op_time = self.query_or("get_op_time", self.adapter.get_op_time(), 0).await;
        let extra = self.query_or("get_extra", self.adapter.get_extra(), BTreeMap::new()).await;
        let attempts = self.config.renew_attempts.max(1);

        let mut renewed = None;
        for attempt in 1..=attempts {
            match self
                .call("renew_leader", self.store.renew_leader(member, op_time, extra.clone()))
                .await
            {
                Ok(snapshot) => {
                    renewed = Some(snapshot);
                    break;
                }
                Err(e @ Error::NotLeader { .. }) => {
                    warn!(member, error = %e, "Lease was taken over");
                    break;
                }
                Err(e) => {
                    debug!(member, attempt, error = %e, "Lease renewal failed");
                    if attempt < attempts {
                        if let Err(e) = self.call("refresh", self.store.refresh()).await {
                            debug!(member, error = %e, "Re-read after failed renewal failed");
                        }
                    }
                }
            }
        }

        let Some(renewed) = renewed else {
            warn!(member, attempts, "Could not renew leader lease, assuming it is lost");
            let _ = self.step_down("leader lease lost").await;
            return Ok(TickOutcome::LockLost);
        };

        self.set_lease(&renewed);
        if hand_off_failed {
            return Ok(TickOutcome::Renewed);
        }
        self.lifecycle("enforce_primary_role", self.adapter.enforce_primary_role(member))
            .await?;
        Ok(TickOutcome::Renewed)
    }

    async fn hand_off(&self, switchover: &Switchover, candidate: &str) -> TickOutcome {
        let member = self.config.member.as_str();
        info!(member, candidate, requested_by = %switchover.leader, "Yielding leadership");

        match self.call("release_leader", self.store.release_leader(member)).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                debug!(member, error = %e, "Release raced another writer, lease will expire instead");
            }
            Err(e) => warn!(member, error = %e, "Could not release lease, it will expire instead"),
        }
        let _ = self.step_down("switchover").await;
        self.state.write().leader = None;
        TickOutcome::SwitchedOver
    }

    async fn elect(&self, record: &ClusterRecord, now: &Timestamp) -> Result<TickOutcome> {
        let member = self.config.member.as_str();

        if self.is_eligible(record, now).await {
            match self.call("try_acquire_leader", self.store.try_acquire_leader(member)).await {
                Ok(acquired) => {
                    info!(member, previous = ?record.leader_name(), "Acquired leader lease");
                    self.set_lease(&acquired);
                    if record.switchover.is_some() {
                        self.clear_switchover().await;
                    }
                    self.lifecycle("enforce_primary_role", self.adapter.enforce_primary_role(member))
                        .await?;
                    return Ok(TickOutcome::Acquired);
                }
                Err(e) if e.is_conflict() => debug!(member, error = %e, "Lost leader election"),
                Err(e) => return Err(e),
            }
        }

        tokio::time::sleep(self.config.grace_period).await;
        let snapshot = self.call("refresh", self.store.refresh()).await?;
        let now = self.store.now();
        match snapshot.record.valid_leader(&now) {
            Some(leader) if leader.name != member => self.follow(Some(leader)).await,
            _ => {
                self.step_down("no lease held").await?;
                self.state.write().leader = None;
                Ok(TickOutcome::Following { leader: None })
            }
        }
    }

    async fn is_eligible(&self, record: &ClusterRecord, now: &Timestamp) -> bool {
        let member = self.config.member.as_str();
        if !self.config.topology.can_lead(self.config.role) {
            return false;
        }

        if let Some(switchover) = &record.switchover {
            match record.switchover_candidate(now) {
                Some(candidate) if candidate == member => {
                    return self
                        .query_or(
                            "process_manual_switchover_from_no_leader",
                            self.adapter.process_manual_switchover_from_no_leader(member, switchover),
                            false,
                        )
                        .await;
                }
                Some(candidate) => {
                    debug!(member, candidate, "Switchover pending for another member");
                    return false;
                }
                None => {}
            }
        }

        let sys_id = self.query_or("get_sys_id", self.adapter.get_sys_id(), String::new()).await;
        let foreign = !record.sys_id.is_empty() && record.sys_id != sys_id;
        if self.query_or("is_leader", self.adapter.is_leader(), false).await {
            if foreign {
                warn!(member, record = %record.sys_id, engine = %sys_id, "Acting primary has a foreign system id");
                return false;
            }
            return true;
        }
        if foreign && !sys_id.is_empty() {
            warn!(member, record = %record.sys_id, engine = %sys_id, "Replica has a foreign system id");
            return false;
        }

        // Only the best ranked member contends, unless the lease has been
        // expired for a whole extra TTL.
        let overdue = record.leader.as_ref().is_some_and(|leader| leader.is_overdue(now));
        let preferred = record.preferred_candidate(now, member);
        if preferred != Some(member) && !overdue {
            debug!(member, preferred = ?preferred, "Deferring to a better placed member");
            return false;
        }

        self.query_or("is_healthiest", self.adapter.is_healthiest(member, record), false)
            .await
    }

    /// Demotes before anything else so two primaries never coexist, then
    /// attaches to `leader`.
    async fn follow(&self, leader: Option<&Leader>) -> Result<TickOutcome> {
        let member = self.config.member.as_str();
        let leader_name = leader.map(|l| l.name.clone());

        self.step_down("another member holds the lease").await?;
        self.call("handle_follow", self.adapter.handle_follow(leader, member))
            .await?;
        self.state.write().leader = leader_name.clone();
        Ok(TickOutcome::Following { leader: leader_name })
    }

    async fn step_down(&self, reason: &'static str) -> Result<()> {
        let member = self.config.member.as_str();
        let believed = self.state.write().lease_valid_until.take().is_some();
        let acting = self.query_or("is_leader", self.adapter.is_leader(), false).await;
        if !believed && !acting {
            return Ok(());
        }

        warn!(member, reason, "Demoting local engine");
        match self.lifecycle("demote", self.adapter.demote(member)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(member, reason, error = %e, "Demotion failed, engine may still accept writes");
                Err(e)
            }
        }
    }

    async fn clear_switchover(&self) {
        if let Err(e) = self.call("cancel_switchover", self.store.cancel_switchover()).await {
            warn!(member = %self.config.member, error = %e, "Could not clear switchover marker");
        }
    }

    fn record_outcome(&self, result: &Result<TickOutcome>) {
        let member = self.config.member.as_str();
        let mut state = self.state.write();
        state.last_tick = Some(self.store.now());
        match result {
            Ok(outcome) => {
                debug!(member, ?outcome, "Reconciled");
                state.last_outcome = Some(outcome.clone());
                state.last_error = None;
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(member, error = %e, "Fatal error, stopping");
                } else if e.is_conflict() {
                    debug!(member, error = %e, "Tick lost a write race");
                } else {
                    warn!(member, error = %e, "Tick aborted");
                }
                state.last_error = Some(e.to_string());
            }
        }
    }

    /// Whether a lease event can change what this member should do. Echoes
    /// of its own writes and writes that keep the known leader are skipped.
    fn wants_tick(&self, event: &LeaseEvent) -> bool {
        match event {
            LeaseEvent::LeaderChanged {
                new_version, leader, ..
            } => {
                if new_version.as_deref().is_some_and(|version| self.store.wrote(version)) {
                    return false;
                }
                *leader != self.state.read().leader
            }
            LeaseEvent::SwitchoverRequested { .. } | LeaseEvent::SwitchoverCleared => true,
        }
    }

    /// Reconciles on relevant lease events and on a fallback timer until
    /// `shutdown` resolves. Ticks never overlap; events queued during a tick
    /// collapse into the next one.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let member = self.config.member.as_str();

        let mut events = watch_lease(self.store.objects().clone(), self.store.keys().clone()).await?;
        let mut events_open = true;
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(member, resync_ms = self.config.resync_interval.as_millis() as u64, "Reconciliation loop started");
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        let mut relevant = self.wants_tick(&event);
                        while let Ok(queued) = events.try_recv() {
                            relevant |= self.wants_tick(&queued);
                        }
                        if !relevant {
                            continue;
                        }
                        debug!(member, ?event, "Lease changed");
                    }
                    None => {
                        warn!(member, "Lease watch closed, relying on periodic resync");
                        events_open = false;
                        continue;
                    }
                },
                _ = resync.tick() => {}
            }

            tokio::select! {
                () = &mut shutdown => break,
                result = self.reconcile() => match result {
                    Err(e) if e.is_fatal() => return Err(e),
                    _ => {}
                },
            }
        }

        info!(member, "Reconciliation loop stopped");
        Ok(())
    }
}
