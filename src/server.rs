//! Status endpoint used for role-aware traffic routing and probes.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use ha::{
    controller::{MemberStatus, TickOutcome},
    record::MemberInfo,
    time::Timestamp,
    topology::{AccessMode, MemberTopology},
    HaController, LeaseSnapshot, Role,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppState {
    pub controller: Arc<HaController>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(controller: Arc<HaController>) -> Self {
        Self {
            controller,
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoleView {
    pub member: String,
    pub role: Option<Role>,
    pub access_mode: AccessMode,
    pub leader: Option<String>,
    pub lease_valid_until: Option<DateTime<Utc>>,
    pub last_outcome: Option<TickOutcome>,
}

#[derive(Debug, Serialize)]
pub struct LeaderView {
    pub name: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
    pub op_time: i64,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SwitchoverView {
    pub leader: String,
    pub candidate: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ClusterView {
    pub sys_id: String,
    pub ttl_seconds: i64,
    pub version: Option<String>,
    pub leader: Option<LeaderView>,
    pub members: BTreeMap<String, MemberInfo>,
    pub switchover: Option<SwitchoverView>,
    /// Order in which members should be restarted for an update, batch by batch.
    pub rollout: Vec<Vec<String>>,
}

impl ClusterView {
    pub fn new(snapshot: LeaseSnapshot, now: &Timestamp, topology: &MemberTopology) -> Self {
        let record = snapshot.record;
        let leader = record.valid_leader(now).map(|leader| leader.name.clone());
        let placement: Vec<(String, Role, AccessMode)> = record
            .members
            .iter()
            .map(|(name, info)| {
                let role = if leader.as_deref() == Some(name.as_str()) {
                    Role::Leader
                } else {
                    info.role
                };
                (name.clone(), role, topology.access_mode(role))
            })
            .collect();
        Self {
            rollout: topology.update_plan(&placement),
            sys_id: record.sys_id,
            ttl_seconds: record.ttl.num_seconds(),
            version: snapshot.version,
            leader: record.leader.map(|leader| LeaderView {
                valid: leader.is_valid(now),
                expires_at: leader.expires_at(),
                name: leader.name,
                acquire_time: leader.acquire_time,
                renew_time: leader.renew_time,
                op_time: leader.op_time,
                extra: leader.extra,
            }),
            members: record.members,
            switchover: record.switchover.map(|switchover| SwitchoverView {
                candidate: switchover.target().map(str::to_string),
                leader: switchover.leader,
                scheduled_at: switchover.scheduled_at,
            }),
        }
    }
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    let MemberStatus { last_error, .. } = state.controller.status();
    Json(Health {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
        last_error,
    })
}

async fn role(State(state): State<AppState>) -> Json<RoleView> {
    let status = state.controller.status();
    let topology = &state.controller.config().topology;
    let access_mode = status.role.map_or(AccessMode::None, |role| topology.access_mode(role));
    Json(RoleView {
        member: status.member,
        role: status.role,
        access_mode,
        leader: status.leader,
        lease_valid_until: status.lease_valid_until,
        last_outcome: status.last_outcome,
    })
}

async fn cluster(State(state): State<AppState>) -> Result<Json<ClusterView>, StatusCode> {
    let store = state.controller.store();
    let snapshot = store.snapshot().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(ClusterView::new(
        snapshot,
        &store.now(),
        &state.controller.config().topology,
    )))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/role", get(role))
        .route("/v1/cluster", get(cluster))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<S>(bind: SocketAddr, state: AppState, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "Status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
