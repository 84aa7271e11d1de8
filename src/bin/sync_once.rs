use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use partner_offline::cache::ResponseCache;
use partner_offline::config;
use partner_offline::remote::{RemoteClient, RemoteService};
use partner_offline::store::LocalStore;
use partner_offline::sync::{SyncManager, SyncOptions};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Drain pending mutations to the remote authority and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Stop after this many passes even if work remains
    #[arg(long, default_value = "10")]
    max_passes: u32,

    /// Exit instead of sleeping through backoff
    #[arg(long)]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = LocalStore::open(&cfg.database_url()).await?;
    let cache = ResponseCache::with_ttl(store.clone(), Duration::from_secs(cfg.cache.ttl_secs));
    let client = RemoteClient::from_config(&cfg.remote)?;
    let online = client.probe().await;
    let remote: Arc<dyn RemoteService> = Arc::new(client);
    let sync = SyncManager::new(
        store.clone(),
        cache,
        remote,
        SyncOptions::from_config(&cfg.sync),
    )
    .await?;
    sync.set_online(online).await;

    let initial = sync.status().await?;
    info!(pending = initial.pending_count, online, "starting sync");
    if !online {
        warn!("remote authority unreachable; nothing attempted");
        store.close().await;
        return Ok(());
    }

    let mut passes = 0;
    let mut succeeded = 0;
    let mut conflicts = 0;
    while passes < args.max_passes {
        if sync.queue().count().await? == 0 {
            break;
        }
        let report = sync.sync_now().await?;
        passes += 1;
        succeeded += report.succeeded;
        conflicts += report.conflicts;

        let Some(delay) = report.retry_in else {
            continue;
        };
        if args.no_wait {
            warn!(?delay, "failures remain; --no-wait given, stopping");
            break;
        }
        info!(?delay, "waiting for backoff");
        tokio::time::sleep(delay).await;
    }

    let status = sync.status().await?;
    println!("passes:      {passes}");
    println!("succeeded:   {succeeded}");
    println!("conflicts:   {conflicts}");
    println!("pending:     {}", status.pending_count);
    if let Some(err) = &status.last_error {
        println!("last error:  {err}");
    }
    for conflict in &status.conflicts {
        println!(
            "conflict {} {} {} ({})",
            conflict.item.id,
            conflict.item.action.as_str(),
            conflict.item.entity.as_str(),
            conflict.item.last_error.as_deref().unwrap_or("no error recorded")
        );
    }

    store.close().await;
    Ok(())
}
