use crate::{
    error::{Error, Result},
    record::{ClusterRecord, Leader, MemberInfo, RecordKeys, Switchover},
    storage::ObjectStore,
    time::{Clock, Timestamp},
    topology::MemberTopology,
    Role,
};
use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes that lose a race during `init` are re-evaluated this many times.
const INIT_ATTEMPTS: usize = 3;

/// Versions of this handle's own writes kept for [`LeaseStore::wrote`].
const OWN_WRITES: usize = 8;

/// Member entries unseen for this many TTLs are dropped on renewal.
const PRUNE_AFTER_TTLS: i32 = 10;

/// A decoded record together with the version it was read at. `version` is
/// `None` while the leader object does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub record: ClusterRecord,
    pub version: Option<String>,
}

impl LeaseSnapshot {
    pub fn exists(&self) -> bool {
        self.version.is_some()
    }
}

/// Single point of truth for the cluster lease record.
///
/// Every write is a compare-and-swap against the version observed by the
/// latest `load`/`refresh`. A `Conflict` means another writer got there first:
/// reload and decide again, never resubmit the same version.
#[derive(Debug)]
pub struct LeaseStore {
    objects: Arc<dyn ObjectStore>,
    keys: RecordKeys,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    current: RwLock<Option<LeaseSnapshot>>,
    own_writes: Mutex<VecDeque<String>>,
}

impl LeaseStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        keys: RecordKeys,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            objects,
            keys,
            clock,
            default_ttl,
            current: RwLock::new(None),
            own_writes: Mutex::new(VecDeque::with_capacity(OWN_WRITES)),
        }
    }

    pub fn keys(&self) -> &RecordKeys {
        &self.keys
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Reads the record. Fails with `NotFound` when the group has no record
    /// yet; the cached view then holds an empty record.
    pub async fn load(&self) -> Result<LeaseSnapshot> {
        let leader_key = self.keys.leader();
        let leader_obj = self.objects.get(&leader_key).await?;
        let switchover_obj = self.objects.get(&self.keys.switchover()).await?;
        let switchover_data = switchover_obj.as_ref().map(|obj| &obj.data);

        let snapshot = match leader_obj {
            Some(obj) => LeaseSnapshot {
                record: ClusterRecord::from_annotations(&obj.data, switchover_data, self.default_ttl)?,
                version: Some(obj.version),
            },
            None => {
                let mut record = ClusterRecord::empty(self.default_ttl);
                record.switchover = switchover_data.map(Switchover::from_annotations).transpose()?;
                *self.current.write() = Some(LeaseSnapshot { record, version: None });
                return Err(Error::NotFound { key: leader_key });
            }
        };

        *self.current.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Like `load`, but an absent record is an empty snapshot.
    pub async fn refresh(&self) -> Result<LeaseSnapshot> {
        match self.load().await {
            Err(Error::NotFound { .. }) => self
                .snapshot()
                .ok_or_else(|| Error::Other(anyhow::anyhow!("lease view missing after load"))),
            other => other,
        }
    }

    pub fn snapshot(&self) -> Option<LeaseSnapshot> {
        self.current.read().clone()
    }

    async fn view(&self) -> Result<LeaseSnapshot> {
        match self.snapshot() {
            Some(snapshot) => Ok(snapshot),
            None => self.refresh().await,
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|snap| snap.record.has_member(name))
    }

    /// A valid, unexpired leader is present in the last loaded view.
    pub fn is_locked(&self) -> bool {
        let now = self.now();
        self.current
            .read()
            .as_ref()
            .is_some_and(|snap| snap.record.is_locked(&now))
    }

    pub fn leader_name(&self) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .and_then(|snap| snap.record.leader_name().map(str::to_string))
    }

    /// Whether `version` of the leader object came from a write through this
    /// handle. Watchers use it to skip echoes of their own writes.
    pub fn wrote(&self, version: &str) -> bool {
        self.own_writes.lock().iter().any(|v| v == version)
    }

    async fn write(&self, base: &LeaseSnapshot, record: ClusterRecord) -> Result<LeaseSnapshot> {
        let key = self.keys.leader();
        let data = record.to_annotations()?;
        let stored = match &base.version {
            Some(version) => self.objects.update(&key, data, version).await?,
            None => self.objects.create(&key, data).await?,
        };
        {
            let mut own = self.own_writes.lock();
            if own.len() == OWN_WRITES {
                own.pop_front();
            }
            own.push_back(stored.version.clone());
        }
        let snapshot = LeaseSnapshot {
            record,
            version: Some(stored.version),
        };
        *self.current.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Seeds the record at startup, or checks the caller against an existing
    /// one. An existing leader is never replaced here.
    pub async fn init(
        &self,
        is_leader: bool,
        sys_id: &str,
        extra: BTreeMap<String, String>,
        op_time: i64,
        member: &str,
        role: Role,
    ) -> Result<LeaseSnapshot> {
        let mut snapshot = self.refresh().await?;

        for _ in 0..INIT_ATTEMPTS {
            let now = self.now();
            let mut record = snapshot.record.clone();
            let info = MemberInfo {
                role,
                op_time,
                last_seen: now,
            };

            if !snapshot.exists() {
                record.sys_id = sys_id.to_string();
                record.members.insert(member.to_string(), info);
                if is_leader {
                    let mut leader = Leader::new(member, now, record.ttl);
                    leader.op_time = op_time;
                    leader.extra = extra.clone();
                    record.leader = Some(leader);
                }
                match self.write(&snapshot, record).await {
                    Ok(created) => {
                        info!(member, is_leader, "Created lease record");
                        return Ok(created);
                    }
                    Err(e) if e.is_conflict() => {
                        snapshot = self.refresh().await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if !sys_id.is_empty() && !record.sys_id.is_empty() && record.sys_id != sys_id {
                return Err(Error::SysIdMismatch {
                    record: record.sys_id,
                    engine: sys_id.to_string(),
                });
            }

            // Replicas share the primary's system id, so any member may seed it.
            let seed_sys_id = record.sys_id.is_empty() && !sys_id.is_empty();
            if record.has_member(member) && !seed_sys_id {
                return Ok(snapshot);
            }

            if seed_sys_id {
                record.sys_id = sys_id.to_string();
            }
            record.members.insert(member.to_string(), info);
            match self.write(&snapshot, record).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    debug!(member, "Lease record changed during init, re-reading");
                    snapshot = self.refresh().await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict { key: self.keys.leader() })
    }

    /// Takes the lease if no valid leader is recorded in the view this store
    /// last read. One attempt; a `Conflict` means someone else wrote first.
    pub async fn try_acquire_leader(&self, member: &str) -> Result<LeaseSnapshot> {
        let snapshot = self.view().await?;
        let now = self.now();
        if let Some(leader) = snapshot.record.valid_leader(&now) {
            if leader.name != member {
                return Err(Error::AlreadyLocked {
                    holder: leader.name.clone(),
                });
            }
        }

        let mut record = snapshot.record.clone();
        let mut leader = Leader::new(member, now, record.ttl);
        if let Some(info) = record.members.get(member) {
            leader.op_time = info.op_time;
        }
        record.leader = Some(leader);
        self.write(&snapshot, record).await
    }

    pub async fn renew_leader(
        &self,
        member: &str,
        op_time: i64,
        extra: BTreeMap<String, String>,
    ) -> Result<LeaseSnapshot> {
        let snapshot = self.view().await?;
        let mut record = snapshot.record.clone();
        let now = self.now();

        match record.leader.as_mut() {
            Some(leader) if leader.name == member => {
                leader.renew_time = now;
                leader.op_time = op_time;
                leader.extra = extra;
            }
            other => {
                return Err(Error::NotLeader {
                    member: member.to_string(),
                    leader: other.map(|leader| leader.name.clone()),
                })
            }
        }
        if let Some(info) = record.members.get_mut(member) {
            info.op_time = op_time;
            info.last_seen = now;
        }
        let pruned = record.prune_members(&now, record.ttl * PRUNE_AFTER_TTLS, member);
        if pruned > 0 {
            debug!(member, pruned, "Dropped long-gone members from the record");
        }
        self.write(&snapshot, record).await
    }

    /// Clears the leader entry so another member can acquire immediately.
    pub async fn release_leader(&self, member: &str) -> Result<LeaseSnapshot> {
        let snapshot = self.view().await?;
        if snapshot.record.leader_name() != Some(member) {
            return Err(Error::NotLeader {
                member: member.to_string(),
                leader: snapshot.record.leader_name().map(str::to_string),
            });
        }
        let mut record = snapshot.record.clone();
        record.leader = None;
        self.write(&snapshot, record).await
    }

    /// Adds or refreshes this member's entry. Entries seen within half a TTL
    /// with an unchanged role are left alone, so op-time is published at most
    /// twice per TTL.
    pub async fn register_member(&self, member: &str, role: Role, op_time: i64) -> Result<LeaseSnapshot> {
        let snapshot = self.view().await?;
        let now = self.now();
        let fresh_for = snapshot.record.ttl / 2;

        if let Some(info) = snapshot.record.members.get(member) {
            if info.role == role && now - info.last_seen < fresh_for {
                return Ok(snapshot);
            }
        }

        let mut record = snapshot.record.clone();
        record.members.insert(
            member.to_string(),
            MemberInfo {
                role,
                op_time,
                last_seen: now,
            },
        );
        self.write(&snapshot, record).await
    }

    /// Records a manual switchover request against the current leader. The
    /// target must be a known member whose role may lead; `None` means any
    /// member.
    pub async fn request_switchover(&self, target: Option<&str>, topology: &MemberTopology) -> Result<Switchover> {
        let snapshot = self.refresh().await?;
        let now = self.now();
        let leader = snapshot
            .record
            .valid_leader(&now)
            .ok_or_else(|| Error::InvalidSwitchover {
                target: target.unwrap_or_default().to_string(),
                reason: "the group has no leader".into(),
            })?;

        if let Some(target) = target {
            let invalid = |reason: &str| Error::InvalidSwitchover {
                target: target.to_string(),
                reason: reason.to_string(),
            };
            match snapshot.record.members.get(target) {
                None => return Err(invalid("not a known member")),
                Some(info) if !topology.can_lead(info.role) => return Err(invalid("learners cannot lead")),
                Some(_) if target == leader.name => return Err(invalid("already the leader")),
                Some(_) => {}
            }
        }

        let switchover = Switchover {
            leader: leader.name.clone(),
            candidate: target.unwrap_or_default().to_string(),
            scheduled_at: now,
        };
        match self
            .objects
            .create(&self.keys.switchover(), switchover.to_annotations())
            .await
        {
            Ok(_) => {
                info!(leader = %switchover.leader, candidate = %switchover.candidate, "Switchover requested");
                Ok(switchover)
            }
            Err(e) if e.is_conflict() => Err(Error::InvalidSwitchover {
                target: switchover.candidate,
                reason: "a switchover is already pending".into(),
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_switchover(&self) -> Result<()> {
        self.delete_record(&self.keys.switchover()).await
    }

    /// Removes an auxiliary object. Only the switchover marker is ever
    /// deleted; the leader object lives as long as the group.
    pub async fn delete_record(&self, key: &str) -> Result<()> {
        if key == self.keys.leader() {
            return Err(Error::Config(format!("refusing to delete lease record {key}")));
        }
        self.objects.delete(key).await?;
        if key == self.keys.switchover() {
            if let Some(snapshot) = self.current.write().as_mut() {
                snapshot.record.switchover = None;
            }
        }
        Ok(())
    }
}
