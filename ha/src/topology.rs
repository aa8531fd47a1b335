//! Declared shape of a replica group: which roles exist, what traffic each
//! role may serve, and how updates roll across members.

use crate::{
    error::{Error, Result},
    Role,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    None,
    Readonly,
    #[serde(alias = "read-write")]
    Readwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Learner, then followers by increasing access, then the leader.
    #[default]
    Serial,
    /// Learner and a minority of followers together, then the remaining
    /// followers, then the leader, keeping a majority online.
    BestEffortParallel,
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberTopology {
    pub leader: RoleSpec,
    pub followers: Vec<RoleSpec>,
    pub learner: Option<RoleSpec>,
    pub update_strategy: UpdateStrategy,
}

impl Default for MemberTopology {
    fn default() -> Self {
        Self {
            leader: RoleSpec {
                name: "leader".to_string(),
                access_mode: AccessMode::Readwrite,
                replicas: 1,
            },
            followers: vec![RoleSpec {
                name: "follower".to_string(),
                access_mode: AccessMode::Readonly,
                replicas: 2,
            }],
            learner: None,
            update_strategy: UpdateStrategy::Serial,
        }
    }
}

impl MemberTopology {
    pub fn validate(&self) -> Result<()> {
        if self.leader.replicas != 1 {
            return Err(Error::Config(format!(
                "exactly one leader is required, topology declares {}",
                self.leader.replicas
            )));
        }
        if self.leader.access_mode == AccessMode::None {
            return Err(Error::Config("leader role must serve traffic".into()));
        }
        if let Some(learner) = &self.learner {
            if learner.replicas > 1 {
                return Err(Error::Config(format!(
                    "at most one learner is allowed, topology declares {}",
                    learner.replicas
                )));
            }
        }

        let mut names: Vec<&str> = std::iter::once(self.leader.name.as_str())
            .chain(self.followers.iter().map(|f| f.name.as_str()))
            .chain(self.learner.iter().map(|l| l.name.as_str()))
            .collect();
        if names.iter().any(|name| name.is_empty()) {
            return Err(Error::Config("role names must not be empty".into()));
        }
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(Error::Config(format!("duplicate role name {:?}", dup[0])));
        }
        Ok(())
    }

    /// Traffic a member in `role` may serve. Followers with different access
    /// modes share one role, so the most permissive follower mode is reported.
    pub fn access_mode(&self, role: Role) -> AccessMode {
        match role {
            Role::Leader => self.leader.access_mode,
            Role::Follower => self
                .followers
                .iter()
                .map(|f| f.access_mode)
                .max_by_key(|mode| access_rank(*mode))
                .unwrap_or(AccessMode::None),
            Role::Learner => self.learner.as_ref().map_or(AccessMode::None, |l| l.access_mode),
        }
    }

    /// Learners never vote and never lead.
    pub fn can_lead(&self, role: Role) -> bool {
        role != Role::Learner
    }

    /// Orders members into update batches. `members` pairs pod names with
    /// their current role and access mode.
    pub fn update_plan(&self, members: &[(String, Role, AccessMode)]) -> Vec<Vec<String>> {
        let mut ordered: Vec<&(String, Role, AccessMode)> = members.iter().collect();
        ordered.sort_by_key(|(name, role, mode)| (role_rank(*role), access_rank(*mode), name.clone()));

        match self.update_strategy {
            UpdateStrategy::Parallel => vec![ordered.iter().map(|(name, ..)| name.clone()).collect()],
            UpdateStrategy::Serial => ordered.iter().map(|(name, ..)| vec![name.clone()]).collect(),
            UpdateStrategy::BestEffortParallel => {
                let followers: Vec<&String> = ordered
                    .iter()
                    .filter(|(_, role, _)| *role == Role::Follower)
                    .map(|(name, ..)| name)
                    .collect();
                let voters = followers.len() + usize::from(ordered.iter().any(|(_, r, _)| *r == Role::Leader));
                // Followers that may be down at once while a majority stays up.
                let minority = voters.saturating_sub(voters / 2 + 1);

                let mut first: Vec<String> = ordered
                    .iter()
                    .filter(|(_, role, _)| *role == Role::Learner)
                    .map(|(name, ..)| name.clone())
                    .collect();
                first.extend(followers.iter().take(minority).map(|name| (*name).clone()));
                let rest: Vec<String> = followers.iter().skip(minority).map(|name| (*name).clone()).collect();
                let leader: Vec<String> = ordered
                    .iter()
                    .filter(|(_, role, _)| *role == Role::Leader)
                    .map(|(name, ..)| name.clone())
                    .collect();

                [first, rest, leader].into_iter().filter(|batch| !batch.is_empty()).collect()
            }
        }
    }
}

fn access_rank(mode: AccessMode) -> u8 {
    match mode {
        AccessMode::None => 0,
        AccessMode::Readonly => 1,
        AccessMode::Readwrite => 2,
    }
}

fn role_rank(role: Role) -> u8 {
    match role {
        Role::Learner => 0,
        Role::Follower => 1,
        Role::Leader => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<(String, Role, AccessMode)> {
        vec![
            ("pod-0".into(), Role::Leader, AccessMode::Readwrite),
            ("pod-1".into(), Role::Follower, AccessMode::Readwrite),
            ("pod-2".into(), Role::Follower, AccessMode::None),
            ("pod-3".into(), Role::Follower, AccessMode::Readonly),
            ("pod-4".into(), Role::Learner, AccessMode::None),
        ]
    }

    #[test]
    fn test_default_topology_is_valid() {
        let topology = MemberTopology::default();
        topology.validate().unwrap();
        assert!(topology.can_lead(Role::Follower));
        assert!(!topology.can_lead(Role::Learner));
        assert_eq!(topology.access_mode(Role::Leader), AccessMode::Readwrite);
        assert_eq!(topology.access_mode(Role::Learner), AccessMode::None);
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let mut two_leaders = MemberTopology::default();
        two_leaders.leader.replicas = 2;
        assert!(two_leaders.validate().is_err());

        let mut duplicate = MemberTopology::default();
        duplicate.followers[0].name = "leader".into();
        assert!(duplicate.validate().is_err());

        let mut learners = MemberTopology::default();
        learners.learner = Some(RoleSpec {
            name: "learner".into(),
            access_mode: AccessMode::None,
            replicas: 2,
        });
        assert!(learners.validate().is_err());
    }

    #[test]
    fn test_serial_plan_order() {
        let topology = MemberTopology::default();
        let plan = topology.update_plan(&members());
        let flat: Vec<&str> = plan.iter().map(|batch| batch[0].as_str()).collect();
        assert_eq!(flat, vec!["pod-4", "pod-2", "pod-3", "pod-1", "pod-0"]);
    }

    #[test]
    fn test_best_effort_parallel_keeps_majority() {
        let topology = MemberTopology {
            update_strategy: UpdateStrategy::BestEffortParallel,
            ..MemberTopology::default()
        };
        let plan = topology.update_plan(&members());
        // 4 voters: at most one may be down at a time.
        assert_eq!(plan[0], vec!["pod-4".to_string(), "pod-2".to_string()]);
        assert_eq!(plan[1], vec!["pod-3".to_string(), "pod-1".to_string()]);
        assert_eq!(plan[2], vec!["pod-0".to_string()]);
    }

    #[test]
    fn test_access_mode_parses_from_config() {
        let spec: RoleSpec =
            serde_json::from_str(r#"{"name": "follower", "access_mode": "readonly", "replicas": 2}"#).unwrap();
        assert_eq!(spec.access_mode, AccessMode::Readonly);
        let mode: AccessMode = serde_json::from_str("\"read-write\"").unwrap();
        assert_eq!(mode, AccessMode::Readwrite);
    }
}
