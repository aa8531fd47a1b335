use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Conflict writing {key:?}: object changed since it was read")]
    Conflict { key: String },

    #[error("Object {key:?} not found")]
    NotFound { key: String },

    #[error("Lease already held by {holder:?}")]
    AlreadyLocked { holder: String },

    #[error("Member {member:?} is not the recorded leader (leader: {leader:?})")]
    NotLeader { member: String, leader: Option<String> },

    #[error("System identifier mismatch: record has {record:?}, engine reports {engine:?}")]
    SysIdMismatch { record: String, engine: String },

    #[error("Invalid switchover target {target:?}: {reason}")]
    InvalidSwitchover { target: String, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Operation {op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("Engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("Engine state invalid: {0}")]
    EngineState(String),

    #[error("Operation {op} is not supported by engine {engine}")]
    Unsupported { engine: &'static str, op: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed lease record: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// A lost compare-and-swap race. Callers re-observe instead of reporting it.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::AlreadyLocked { .. })
    }

    /// Transient failures worth another attempt on the next try or tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::Timeout { .. }
                | Error::EngineUnreachable(_)
                | Error::Http(_)
                | Error::Postgres(_)
                | Error::Io(_)
        ) || self.is_conflict()
    }

    /// Errors that need an operator; the agent process exits on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Unsupported { .. } | Error::SysIdMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
