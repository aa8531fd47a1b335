use anyhow::Result;
use clap::Parser;
use hapod::{cluster_status, init_tracing, lease_store, switchover, Agent, Cli, Commands, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log, cli.verbosity)?;

    match cli.command {
        Commands::Run => {
            let agent = Agent::new(config)?;
            agent.run(shutdown_signal()).await
        }
        Commands::Status => {
            let store = lease_store(&config)?;
            match cluster_status(&store, &config.topology).await? {
                Some(json) => println!("{json}"),
                None => println!("no lease record for {}", config.record_keys().prefix()),
            }
            Ok(())
        }
        Commands::Switchover { target, cancel } => {
            let store = lease_store(&config)?;
            println!("{}", switchover(&store, &config.topology, target.as_deref(), cancel).await?);
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
