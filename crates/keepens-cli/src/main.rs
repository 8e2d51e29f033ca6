use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keepens_core::is_hex_address;
use keepens_engine::{maybe_build_scheduler, AppConfig, Services};
use keepens_storage::PgSubscriptionStore;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "keepens")]
#[command(about = "KeepENS domain expiry notifier")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print every domain owned by an address, soonest expiry first
    Resolve { address: String },
    /// Print wallets linked to a Farcaster id
    Connected { fid: String },
    /// Run one expiry notification sweep
    Notify,
    /// Start the HTTP API
    Serve,
    /// Apply Postgres migrations
    Migrate,
    /// Run the notification sweep on its cron schedule until Ctrl-C
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Resolve { address } => {
            if !is_hex_address(&address) {
                warn!(address = %address, "address does not look like a 0x-prefixed hex address");
            }
            let services = Services::from_env().await?;
            let domains = services.resolver.resolve(&address).await?;
            println!("{}", serde_json::to_string_pretty(&domains)?);
        }
        Commands::Connected { fid } => {
            let services = Services::from_env().await?;
            let addresses = services.connected.resolve_addresses_for_identity(&fid).await;
            println!("{}", serde_json::to_string_pretty(&addresses)?);
        }
        Commands::Notify => {
            let services = Services::from_env().await?;
            let summary = services.notifier.run_once(chrono::Utc::now()).await?;
            println!(
                "notify complete: sent={} failed={} skipped={}",
                summary.sent, summary.failed, summary.skipped
            );
            for error in &summary.errors {
                eprintln!("  {error}");
            }
        }
        Commands::Serve => {
            let services = Services::from_env().await?;
            let scheduler =
                maybe_build_scheduler(&services.config, services.notifier.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %services.config.notify_cron, "expiry sweep scheduled");
            }
            keepens_web::serve(&services).await?;
        }
        Commands::Migrate => {
            let config = AppConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgSubscriptionStore::connect(&url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut config = AppConfig::from_env();
            config.scheduler_enabled = true;
            let services = Services::from_config(config).await?;
            let mut sched = maybe_build_scheduler(&services.config, services.notifier.clone())
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(
                cron = %services.config.notify_cron,
                "expiry sweep scheduled; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
