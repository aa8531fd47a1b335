//! `hapod`: the per-pod agent that keeps one database member in line with
//! its replica group's lease record.

pub mod cli;
pub mod config;
pub mod server;

pub use cli::{Cli, Commands};
pub use config::Config;

use anyhow::Context;
use config::{LogConfig, StoreBackend};
use ha::{
    kube::KubernetesObjectStore, time::SystemClock, AdapterRegistry, HaController,
    InMemoryObjectStore, LeaseStore, MemberTopology, ObjectStore,
};
use server::{AppState, ClusterView};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// `-v` raises the level past the configured one; `RUST_LOG` wins over the
/// config file otherwise.
pub fn init_tracing(log: &LogConfig, verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
            _ => EnvFilter::try_new(&log.level),
        },
        1 => EnvFilter::try_new("debug"),
        _ => EnvFilter::try_new("trace"),
    }
    .with_context(|| format!("invalid log filter {:?}", log.level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(log.ansi)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Builds the lease store for the configured backend.
pub fn lease_store(config: &Config) -> anyhow::Result<Arc<LeaseStore>> {
    let objects: Arc<dyn ObjectStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; leadership is local to this process");
            Arc::new(InMemoryObjectStore::new())
        }
        StoreBackend::Kubernetes => Arc::new(KubernetesObjectStore::new(config.kube_config()?)?),
    };
    Ok(Arc::new(LeaseStore::new(
        objects,
        config.record_keys(),
        Arc::new(SystemClock),
        config.ttl(),
    )))
}

pub struct Agent {
    config: Config,
    controller: Arc<HaController>,
}

impl Agent {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let registry = AdapterRegistry::with_builtin();
        let adapter = registry
            .build(&config.engine.kind, &config.engine_config())
            .with_context(|| format!("cannot set up {} adapter", config.engine.kind))?;
        let store = lease_store(&config)?;
        let controller = Arc::new(HaController::new(config.controller_config(), store, adapter));
        Ok(Self { config, controller })
    }

    pub fn controller(&self) -> &Arc<HaController> {
        &self.controller
    }

    /// Joins the replica group and reconciles until `shutdown` resolves or a
    /// fatal error occurs.
    pub async fn run<S>(self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        });

        let member = self.config.member.pod_name.clone();
        info!(
            member = %member,
            cluster = %self.config.member.cluster,
            component = %self.config.member.component,
            engine = %self.config.engine.kind,
            "Starting agent"
        );

        let server = if self.config.server.enabled {
            let state = AppState::new(self.controller.clone());
            let bind = self.config.server.bind;
            let stop = stopped(stop_rx.clone());
            Some(tokio::spawn(async move { server::serve(bind, state, stop).await }))
        } else {
            None
        };

        let result = async {
            tokio::select! {
                () = stopped(stop_rx.clone()) => return Ok(()),
                joined = self.controller.join() => { joined?; }
            }
            self.controller.run(stopped(stop_rx.clone())).await
        }
        .await;

        // The status endpoint goes down with the controller.
        if let Some(server) = server {
            server.abort();
            match server.await {
                Ok(Err(e)) => warn!(error = %e, "Status endpoint failed"),
                Ok(Ok(())) | Err(_) => {}
            }
        }

        match &result {
            Ok(()) => info!(member = %member, "Agent stopped"),
            Err(e) => warn!(member = %member, error = %e, "Agent stopped on error"),
        }
        result.map_err(Into::into)
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Current record as pretty JSON, or `None` when the group has none yet.
pub async fn cluster_status(store: &LeaseStore, topology: &MemberTopology) -> anyhow::Result<Option<String>> {
    let snapshot = store.refresh().await?;
    if snapshot.version.is_none() {
        return Ok(None);
    }
    let view = ClusterView::new(snapshot, &store.now(), topology);
    Ok(Some(serde_json::to_string_pretty(&view)?))
}

/// Files or withdraws a switchover request and describes what was done.
pub async fn switchover(
    store: &LeaseStore,
    topology: &MemberTopology,
    target: Option<&str>,
    cancel: bool,
) -> anyhow::Result<String> {
    if cancel {
        store.cancel_switchover().await?;
        return Ok("switchover request withdrawn".to_string());
    }
    let request = store.request_switchover(target, topology).await?;
    Ok(match request.target() {
        Some(candidate) => format!("switchover from {} to {candidate} requested", request.leader),
        None => format!("switchover away from {} requested", request.leader),
    })
}
