//! PostgreSQL streaming-replication adapter.
//!
//! Role and progress come from SQL (`pg_is_in_recovery`, WAL positions);
//! lifecycle changes that need a restart go through `pg_ctl`.

use crate::{
    adapter::{DatabaseAdapter, EngineConfig},
    error::{Error, Result},
    record::{ClusterRecord, Leader, Switchover},
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

pub const ENGINE: &str = "postgresql";

const OP_TIME_QUERY: &str = "SELECT (CASE WHEN pg_is_in_recovery() \
     THEN COALESCE(pg_last_wal_replay_lsn(), pg_last_wal_receive_lsn()) \
     ELSE pg_current_wal_lsn() END - '0/0'::pg_lsn)::bigint";

const CAUGHT_UP_QUERY: &str = "SELECT pg_last_wal_receive_lsn() IS NULL \
     OR pg_last_wal_replay_lsn() >= pg_last_wal_receive_lsn()";

pub fn construct(config: &EngineConfig) -> Result<Arc<dyn DatabaseAdapter>> {
    Ok(Arc::new(PostgresAdapter::from_config(config)?))
}

#[derive(Debug, Clone)]
pub struct PostgresAdapter {
    url: String,
    data_dir: PathBuf,
    pg_ctl: String,
    /// Address template for other members; `{member}` is replaced by the pod name.
    host_template: String,
    port: u16,
    replication_user: String,
    replication_password: Option<String>,
    connect_timeout: Duration,
}

impl PostgresAdapter {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let port = match config.property("port") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid postgres port {raw:?}")))?,
            None => 5432,
        };
        let connect_timeout_ms = match config.property("connect_timeout_ms") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid connect_timeout_ms {raw:?}")))?,
            None => 3_000,
        };

        Ok(Self {
            url: config.require("url")?.to_string(),
            data_dir: PathBuf::from(config.property("data_dir").unwrap_or("/home/postgres/pgdata")),
            pg_ctl: config.property("pg_ctl").unwrap_or("pg_ctl").to_string(),
            host_template: config.property("host_template").unwrap_or("{member}").to_string(),
            port,
            replication_user: config.property("replication_user").unwrap_or("postgres").to_string(),
            replication_password: config.property("replication_password").map(str::to_string),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        })
    }

    fn host_of(&self, member: &str) -> String {
        self.host_template.replace("{member}", member)
    }

    fn primary_conninfo(&self, leader: &str, member: &str) -> String {
        let mut conninfo = format!(
            "host={} port={} user={} application_name={}",
            self.host_of(leader),
            self.port,
            self.replication_user,
            member
        );
        if let Some(password) = &self.replication_password {
            conninfo.push_str(&format!(" password={password}"));
        }
        conninfo
    }

    async fn connect(&self) -> Result<Client> {
        let connecting = tokio_postgres::connect(&self.url, NoTls);
        let (client, connection) = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(Error::EngineUnreachable(e.to_string())),
            Err(_) => return Err(Error::EngineUnreachable("connect timed out".into())),
        };
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Postgres connection closed");
            }
        });
        Ok(client)
    }

    async fn query_bool(&self, sql: &str) -> Result<bool> {
        let client = self.connect().await?;
        let row = client.query_one(sql, &[]).await?;
        Ok(row.get::<_, Option<bool>>(0).unwrap_or(false))
    }

    async fn pg_ctl(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.pg_ctl)
            .args(args)
            .arg("-D")
            .arg(&self.data_dir)
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::EngineState(format!(
                "pg_ctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `ALTER SYSTEM` refuses to run inside a transaction block, and a
/// multi-statement simple query is one implicit transaction, so this must be
/// sent on its own.
fn alter_conninfo_sql(conninfo: &str) -> String {
    format!("ALTER SYSTEM SET primary_conninfo = {}", quote_literal(conninfo))
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    async fn init_delay(&self) -> Result<()> {
        let client = self.connect().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn is_leader(&self) -> Result<bool> {
        Ok(!self.query_bool("SELECT pg_is_in_recovery()").await?)
    }

    async fn is_running(&self, _member: &str) -> Result<bool> {
        match self.init_delay().await {
            Ok(()) => Ok(true),
            Err(Error::EngineUnreachable(_) | Error::Postgres(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_sys_id(&self) -> Result<String> {
        let client = self.connect().await?;
        let row = client
            .query_one("SELECT system_identifier::text FROM pg_control_system()", &[])
            .await?;
        Ok(row.get(0))
    }

    async fn get_extra(&self) -> Result<BTreeMap<String, String>> {
        let client = self.connect().await?;
        let row = client
            .query_one(
                "SELECT timeline_id::text, redo_lsn::text FROM pg_control_checkpoint()",
                &[],
            )
            .await?;
        let mut extra = BTreeMap::new();
        extra.insert("timeline".to_string(), row.get::<_, String>(0));
        extra.insert("checkpoint_lsn".to_string(), row.get::<_, String>(1));
        Ok(extra)
    }

    async fn get_op_time(&self) -> Result<i64> {
        let client = self.connect().await?;
        let row = client.query_one(OP_TIME_QUERY, &[]).await?;
        Ok(row.get::<_, Option<i64>>(0).unwrap_or(0))
    }

    async fn start(&self, member: &str) -> Result<()> {
        if self.is_running(member).await? {
            return Ok(());
        }
        info!(member, data_dir = %self.data_dir.display(), "Starting postgres");
        self.pg_ctl(&["start", "-w", "-t", "60"]).await
    }

    async fn demote(&self, member: &str) -> Result<()> {
        if !self.is_leader().await? {
            return Ok(());
        }
        warn!(member, "Demoting postgres primary to standby");
        self.pg_ctl(&["stop", "-m", "fast", "-w"]).await?;
        tokio::fs::write(self.data_dir.join("standby.signal"), b"").await?;
        self.pg_ctl(&["start", "-w", "-t", "60"]).await
    }

    async fn enforce_primary_role(&self, member: &str) -> Result<()> {
        if self.is_leader().await? {
            return Ok(());
        }
        info!(member, "Promoting postgres standby");
        if self.query_bool("SELECT pg_promote(true, 60)").await? {
            Ok(())
        } else {
            Err(Error::EngineState("pg_promote did not finish within 60s".into()))
        }
    }

    async fn is_healthiest(&self, member: &str, cluster: &ClusterRecord) -> Result<bool> {
        let local = self.get_op_time().await?;
        Ok(cluster
            .best_sibling_op_time(&Utc::now(), member)
            .map_or(true, |best| local >= best))
    }

    async fn process_manual_switchover_from_leader(
        &self,
        member: &str,
        switchover: &Switchover,
    ) -> Result<bool> {
        if !self.is_leader().await? {
            return Ok(true);
        }
        info!(member, candidate = %switchover.candidate, "Handing off primary role");
        let client = self.connect().await?;
        client.simple_query("CHECKPOINT").await?;
        drop(client);
        self.demote(member).await?;
        Ok(true)
    }

    async fn process_manual_switchover_from_no_leader(
        &self,
        member: &str,
        _switchover: &Switchover,
    ) -> Result<bool> {
        if !self.is_running(member).await? {
            return Ok(false);
        }
        self.query_bool(CAUGHT_UP_QUERY).await
    }

    async fn handle_follow(&self, leader: Option<&Leader>, member: &str) -> Result<()> {
        let Some(leader) = leader else {
            return Ok(());
        };
        if leader.name == member {
            return Ok(());
        }

        let client = self.connect().await?;
        let desired = self.primary_conninfo(&leader.name, member);
        let current: String = client.query_one("SHOW primary_conninfo", &[]).await?.get(0);
        if current == desired {
            return Ok(());
        }

        let in_recovery = client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await?
            .get::<_, bool>(0);
        if !in_recovery {
            return Err(Error::EngineState(format!(
                "{member} still acts as primary, demote before following {}",
                leader.name
            )));
        }

        info!(member, leader = %leader.name, "Pointing replication at new leader");
        client.batch_execute(&alter_conninfo_sql(&desired)).await?;
        client.simple_query("SELECT pg_reload_conf()").await?;
        Ok(())
    }
}
