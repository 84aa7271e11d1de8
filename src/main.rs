use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use partner_offline::cache::ResponseCache;
use partner_offline::config;
use partner_offline::remote::{RemoteClient, RemoteService};
use partner_offline::store::LocalStore;
use partner_offline::sync::{SyncEvent, SyncManager, SyncOptions};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = LocalStore::open(&cfg.database_url()).await?;
    let cache = ResponseCache::with_ttl(store.clone(), Duration::from_secs(cfg.cache.ttl_secs));
    let remote: Arc<dyn RemoteService> = Arc::new(RemoteClient::from_config(&cfg.remote)?);

    let sync = SyncManager::new(
        store.clone(),
        cache.clone(),
        remote,
        SyncOptions::from_config(&cfg.sync),
    )
    .await?;

    let mut events = sync.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::PassCompleted(report)) => info!(?report, "sync pass"),
                Ok(SyncEvent::SyncError { message }) => warn!(%message, "sync error"),
                Ok(SyncEvent::ConflictRaised(conflict)) => warn!(
                    id = %conflict.item.id,
                    entity = conflict.item.entity.as_str(),
                    last_error = ?conflict.item.last_error,
                    "mutation needs manual resolution"
                ),
                Ok(event) => info!(?event, "sync event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "sync event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    sync.start().await;
    sync.spawn_connectivity_probe(Duration::from_secs(cfg.remote.probe_interval_secs))
        .await;
    let sweeper = cache.spawn_sweeper(Duration::from_secs(cfg.cache.sweep_interval_secs));

    let status = sync.status().await?;
    info!(
        pending = status.pending_count,
        last_sync_at = ?status.last_sync_at,
        "partner-offline running; press Ctrl-C to stop"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    sweeper.abort();
    sync.close().await;
    store.close().await;
    Ok(())
}
