#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Leader coordination for database replica groups.
//!
//! Members agree on a single writable primary through one versioned record
//! in a shared store. Each member runs an [`HaController`] that reconciles
//! its local engine, reached through a [`DatabaseAdapter`], against that
//! record.

pub mod adapter;
pub mod controller;
pub mod engine;
pub mod error;
pub mod event;
pub mod kube;
pub mod lease;
pub mod record;
pub mod retry;
pub mod storage;
pub mod time;
pub mod topology;

pub mod test_utils;

pub use adapter::{AdapterRegistry, DatabaseAdapter, EngineConfig};
pub use controller::{ControllerConfig, HaController, MemberStatus, TickOutcome};
pub use error::{Error, Result};
pub use lease::{LeaseSnapshot, LeaseStore};
pub use record::{ClusterRecord, Leader, MemberInfo, RecordKeys, Switchover};
pub use storage::{InMemoryObjectStore, ObjectStore};
pub use topology::MemberTopology;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
    Learner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Learner => "learner",
        })
    }
}
