//! The cluster lease record and its string-map encoding.
//!
//! A record is persisted as two objects: the leader object carries the lease,
//! the system identifier and the member table; the switchover object exists
//! only while a manual switchover is pending.

use crate::{
    error::{Error, Result},
    time::{format_timestamp, parse_timestamp, Timestamp},
    Role,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Annotations = BTreeMap<String, String>;

pub const LEADER_SUFFIX: &str = "-leader";
pub const SWITCHOVER_SUFFIX: &str = "-switchover";

pub const SYS_ID: &str = "sys-id";
pub const TTL: &str = "ttl";
pub const LEADER: &str = "leader";
pub const ACQUIRE_TIME: &str = "acquire-time";
pub const RENEW_TIME: &str = "renew-time";
pub const OP_TIME: &str = "op-time";
pub const EXTRA: &str = "extra";
pub const MEMBERS: &str = "members";
pub const CANDIDATE: &str = "candidate";
pub const SCHEDULED_AT: &str = "scheduled-at";

/// Object names for one replica group, `{cluster}-{component}-leader` and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKeys {
    pub cluster: String,
    pub component: String,
}

impl RecordKeys {
    pub fn new(cluster: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            component: component.into(),
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}-{}", self.cluster, self.component)
    }

    pub fn leader(&self) -> String {
        format!("{}{}", self.prefix(), LEADER_SUFFIX)
    }

    pub fn switchover(&self) -> String {
        format!("{}{}", self.prefix(), SWITCHOVER_SUFFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    pub name: String,
    pub acquire_time: Timestamp,
    pub renew_time: Timestamp,
    pub ttl: Duration,
    pub op_time: i64,
    pub extra: BTreeMap<String, String>,
}

impl Leader {
    pub fn new(name: &str, now: Timestamp, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            acquire_time: now,
            renew_time: now,
            ttl,
            op_time: 0,
            extra: BTreeMap::new(),
        }
    }

    /// A lease stays valid until `ttl` has fully elapsed since the last renewal.
    pub fn is_valid(&self, now: &Timestamp) -> bool {
        *now - self.renew_time <= self.ttl
    }

    pub fn expires_at(&self) -> Timestamp {
        self.renew_time + self.ttl
    }

    /// Expired for at least one more full TTL: the holder had a whole extra
    /// lease period to come back and did not.
    pub fn is_overdue(&self, now: &Timestamp) -> bool {
        *now - self.expires_at() > self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub role: Role,
    pub op_time: i64,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switchover {
    /// Leader at the time the request was made.
    pub leader: String,
    /// Requested new leader; empty means "the best eligible member".
    pub candidate: String,
    pub scheduled_at: Timestamp,
}

impl Switchover {
    pub fn target(&self) -> Option<&str> {
        if self.candidate.is_empty() {
            None
        } else {
            Some(&self.candidate)
        }
    }

    pub fn to_annotations(&self) -> Annotations {
        let mut out = Annotations::new();
        out.insert(LEADER.to_string(), self.leader.clone());
        out.insert(CANDIDATE.to_string(), self.candidate.clone());
        out.insert(SCHEDULED_AT.to_string(), format_timestamp(&self.scheduled_at));
        out
    }

    pub fn from_annotations(data: &Annotations) -> Result<Self> {
        let scheduled_at = match data.get(SCHEDULED_AT) {
            Some(raw) => parse_timestamp(raw)?,
            None => return Err(Error::Malformed("switchover without scheduled-at".into())),
        };
        Ok(Self {
            leader: data.get(LEADER).cloned().unwrap_or_default(),
            candidate: data.get(CANDIDATE).cloned().unwrap_or_default(),
            scheduled_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    pub sys_id: String,
    pub ttl: Duration,
    pub leader: Option<Leader>,
    pub members: BTreeMap<String, MemberInfo>,
    pub switchover: Option<Switchover>,
}

impl ClusterRecord {
    pub fn empty(ttl: Duration) -> Self {
        Self {
            sys_id: String::new(),
            ttl,
            leader: None,
            members: BTreeMap::new(),
            switchover: None,
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn valid_leader(&self, now: &Timestamp) -> Option<&Leader> {
        self.leader.as_ref().filter(|leader| leader.is_valid(now))
    }

    pub fn is_locked(&self, now: &Timestamp) -> bool {
        self.valid_leader(now).is_some()
    }

    /// Name of the recorded leader, expired or not.
    pub fn leader_name(&self) -> Option<&str> {
        self.leader.as_ref().map(|leader| leader.name.as_str())
    }

    /// Non-learner members seen within three TTLs.
    pub fn fresh_members(&self, now: &Timestamp) -> impl Iterator<Item = (&str, &MemberInfo)> + '_ {
        let now = *now;
        let horizon = self.ttl * 3;
        self.members
            .iter()
            .filter(|(_, info)| info.role != Role::Learner)
            .filter(move |(_, info)| now - info.last_seen <= horizon)
            .map(|(name, info)| (name.as_str(), info))
    }

    /// Members that may lead, best first: highest op-time, then smallest name.
    /// Learners and entries not seen within three TTLs are left out.
    pub fn ranked_candidates(&self, now: &Timestamp) -> Vec<&str> {
        let mut candidates: Vec<(&str, &MemberInfo)> = self.fresh_members(now).collect();
        candidates.sort_by(|(a_name, a), (b_name, b)| {
            b.op_time.cmp(&a.op_time).then_with(|| a_name.cmp(b_name))
        });
        candidates.into_iter().map(|(name, _)| name).collect()
    }

    /// The member expected to take an empty or expired lease: the best ranked
    /// one, passing over the recorded leader unless that is `member` itself.
    pub fn preferred_candidate(&self, now: &Timestamp, member: &str) -> Option<&str> {
        let stale = self.leader_name();
        self.ranked_candidates(now)
            .into_iter()
            .find(|name| *name == member || Some(*name) != stale)
    }

    /// Highest op-time among fresh members other than `member`.
    pub fn best_sibling_op_time(&self, now: &Timestamp, member: &str) -> Option<i64> {
        self.fresh_members(now)
            .filter(|(name, _)| *name != member)
            .map(|(_, info)| info.op_time)
            .max()
    }

    /// Drops entries not seen for `horizon`, except `keep`.
    pub fn prune_members(&mut self, now: &Timestamp, horizon: Duration, keep: &str) -> usize {
        let before = self.members.len();
        self.members
            .retain(|name, info| name == keep || *now - info.last_seen <= horizon);
        before - self.members.len()
    }

    /// Resolves the member a switchover should hand leadership to. An explicit
    /// target wins; "any" picks the best ranked member other than the leader
    /// that requested the handoff.
    pub fn switchover_candidate(&self, now: &Timestamp) -> Option<&str> {
        let switchover = self.switchover.as_ref()?;
        match switchover.target() {
            Some(target) => Some(target),
            None => self
                .ranked_candidates(now)
                .into_iter()
                .find(|name| *name != switchover.leader),
        }
    }

    pub fn to_annotations(&self) -> Result<Annotations> {
        let mut out = Annotations::new();
        out.insert(SYS_ID.to_string(), self.sys_id.clone());
        out.insert(TTL.to_string(), self.ttl.num_seconds().to_string());
        match &self.leader {
            Some(leader) => {
                out.insert(LEADER.to_string(), leader.name.clone());
                out.insert(ACQUIRE_TIME.to_string(), format_timestamp(&leader.acquire_time));
                out.insert(RENEW_TIME.to_string(), format_timestamp(&leader.renew_time));
                out.insert(OP_TIME.to_string(), leader.op_time.to_string());
                out.insert(EXTRA.to_string(), serde_json::to_string(&leader.extra)?);
            }
            None => {
                // Every key is always written so updates never leave stale lease fields.
                for key in [LEADER, ACQUIRE_TIME, RENEW_TIME, OP_TIME, EXTRA] {
                    out.insert(key.to_string(), String::new());
                }
            }
        }
        out.insert(MEMBERS.to_string(), serde_json::to_string(&self.members)?);
        Ok(out)
    }

    /// Decodes a record. `default_ttl` applies when the stored object carries
    /// no usable TTL.
    pub fn from_annotations(
        leader_data: &Annotations,
        switchover_data: Option<&Annotations>,
        default_ttl: Duration,
    ) -> Result<Self> {
        let ttl = match leader_data.get(TTL) {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::seconds)
                .ok_or_else(|| Error::Malformed(format!("bad ttl {raw:?}")))?,
            None => default_ttl,
        };

        let leader = match leader_data.get(LEADER).filter(|name| !name.is_empty()) {
            Some(name) => {
                let renew_time = match leader_data.get(RENEW_TIME) {
                    Some(raw) => parse_timestamp(raw)?,
                    None => return Err(Error::Malformed(format!("leader {name:?} has no renew-time"))),
                };
                let acquire_time = match leader_data.get(ACQUIRE_TIME) {
                    Some(raw) => parse_timestamp(raw)?,
                    None => renew_time,
                };
                let op_time = leader_data
                    .get(OP_TIME)
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                let extra = match leader_data.get(EXTRA).filter(|raw| !raw.is_empty()) {
                    Some(raw) => serde_json::from_str(raw)?,
                    None => BTreeMap::new(),
                };
                Some(Leader {
                    name: name.clone(),
                    acquire_time,
                    renew_time,
                    ttl,
                    op_time,
                    extra,
                })
            }
            None => None,
        };

        let members = match leader_data.get(MEMBERS).filter(|raw| !raw.is_empty()) {
            Some(raw) => serde_json::from_str(raw)?,
            None => BTreeMap::new(),
        };

        let switchover = switchover_data.map(Switchover::from_annotations).transpose()?;

        Ok(Self {
            sys_id: leader_data.get(SYS_ID).cloned().unwrap_or_default(),
            ttl,
            leader,
            members,
            switchover,
        })
    }
}
