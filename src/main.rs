//! `pos-sync`: headless sync daemon and maintenance commands for the POS
//! terminal's offline store.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pos_offline_sync::models::ConflictChoice;
use pos_offline_sync::network::Connectivity;
use pos_offline_sync::{catalog, db, logging, queue, storage};
use pos_offline_sync::{
    ConflictResolver, Engine, EventHub, HttpPosApi, PosApi, ProductSyncService, SyncConfig,
};

#[derive(Parser, Debug)]
#[command(name = "pos-sync", version, about = "Offline transaction sync for the POS terminal")]
struct Cli {
    /// Directory holding the local database and logs
    #[arg(long, env = "POS_SYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Emit console logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync daemon until interrupted (default)
    Run,
    /// Print queue, conflict and catalog cache status as JSON
    Status,
    /// Requeue failed transactions with a fresh retry budget
    Retry {
        /// Only this transaction
        #[arg(long)]
        id: Option<String>,
    },
    /// Resolve a conflicted transaction
    Resolve {
        local_id: String,
        #[arg(value_parser = parse_choice)]
        choice: ConflictChoice,
    },
    /// Download the full product catalog and images
    SyncCatalog,
    /// Delete every cached product, category and image
    ClearCatalog,
    /// Delete synced transactions from the local queue
    Prune,
    /// Store terminal credentials in the OS keyring
    Configure {
        /// Admin dashboard URL
        #[arg(long)]
        url: Option<String>,
        /// API key, or a connection string carrying URL, key and terminal id
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        terminal_id: Option<String>,
    },
    /// Delete stored credentials
    Reset,
    /// Print version and build information
    About,
}

fn parse_choice(raw: &str) -> Result<ConflictChoice, String> {
    ConflictChoice::parse(raw).ok_or_else(|| format!("expected `local` or `server`, got `{raw}`"))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn http_api(config: &SyncConfig) -> anyhow::Result<Arc<dyn PosApi>> {
    let credentials = storage::load_credentials()
        .context("terminal is not configured; run `pos-sync configure` first")?;
    Ok(Arc::new(HttpPosApi::new(&credentials, config.request_timeout)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(logging::default_data_dir);
    let _log_guard = logging::init_logging(&data_dir, cli.json_logs)
        .context("failed to initialise logging")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&data_dir).await,
        Command::Status => {
            let store = db::init(&data_dir)?;
            let conflicts: Vec<_> = queue::list_by_status(
                &store,
                pos_offline_sync::TransactionStatus::Conflict,
            )?
            .into_iter()
            .map(|txn| {
                json!({
                    "localId": txn.local_id,
                    "referenceNumber": txn.payload.reference_number,
                    "localTotal": txn.payload.totals.total,
                    "serverSnapshot": txn.server_snapshot,
                })
            })
            .collect();
            print_json(&json!({
                "queue": queue::counts(&store)?,
                "conflicts": conflicts,
                "catalog": catalog::stats(&store)?,
                "catalogSyncedAt": catalog::last_sync_time(&store)?,
                "configured": storage::is_configured(),
            }))
        }
        Command::Retry { id } => {
            let store = db::init(&data_dir)?;
            let reset = queue::reset_failed(&store, id.as_deref())?;
            if id.is_some() && reset == 0 {
                bail!("no failed transaction with that id");
            }
            println!("{reset} transaction(s) requeued");
            Ok(())
        }
        Command::Resolve { local_id, choice } => {
            let store = Arc::new(db::init(&data_dir)?);
            let config = SyncConfig::load(&store)?;
            let resolver = ConflictResolver::new(store, http_api(&config)?, EventHub::new());
            let outcome = resolver.resolve(&local_id, choice, None).await?;
            print_json(&serde_json::to_value(outcome.transaction())?)
        }
        Command::SyncCatalog => {
            let store = Arc::new(db::init(&data_dir)?);
            let config = SyncConfig::load(&store)?;
            let api = http_api(&config)?;
            let online = api.health().await.is_ok();
            let service = ProductSyncService::new(
                store,
                api,
                Connectivity::new(online),
                config.image_concurrency,
            );
            let result = service.sync_all().await;
            print_json(&serde_json::to_value(&result)?)?;
            if !result.success {
                bail!(result.error.unwrap_or_else(|| "catalog sync failed".into()));
            }
            Ok(())
        }
        Command::ClearCatalog => {
            let store = db::init(&data_dir)?;
            catalog::clear(&store)?;
            println!("catalog cache cleared");
            Ok(())
        }
        Command::Prune => {
            let store = db::init(&data_dir)?;
            let removed = queue::clear_synced(&store)?;
            println!("{removed} synced transaction(s) removed");
            Ok(())
        }
        Command::Configure {
            url,
            api_key,
            terminal_id,
        } => {
            storage::save_credentials(url.as_deref(), &api_key, terminal_id.as_deref())?;
            println!("credentials saved");
            Ok(())
        }
        Command::Reset => {
            storage::factory_reset()?;
            println!("credentials deleted");
            Ok(())
        }
        Command::About => print_json(&logging::about_info()),
    }
}

async fn run_daemon(data_dir: &Path) -> anyhow::Result<()> {
    let about = logging::about_info();
    info!(
        build = about["buildTimestamp"].as_str().unwrap_or_default(),
        git_sha = about["gitSha"].as_str().unwrap_or_default(),
        "Starting pos-sync v{}",
        env!("CARGO_PKG_VERSION")
    );

    let engine = Engine::open(data_dir, |config| {
        http_api(config).map_err(|e| pos_offline_sync::SyncError::NotConfigured(format!("{e:#}")))
    })?;

    let cancel = CancellationToken::new();
    let handles = engine.start(cancel.clone());

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    if engine.sync.is_sync_in_progress() {
        warn!("Sync in progress; waiting for it to finish (press Ctrl-C again to exit now)");
    } else {
        info!("Shutting down");
    }
    cancel.cancel();

    let wait_all = async {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background task ended abnormally: {e}");
            }
        }
    };
    tokio::select! {
        _ = wait_all => info!("pos-sync stopped"),
        _ = tokio::signal::ctrl_c() => warn!("Second interrupt; exiting without waiting for sync"),
    }
    Ok(())
}
