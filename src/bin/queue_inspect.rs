use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;

use partner_offline::config;
use partner_offline::model::Record;
use partner_offline::queue::MutationQueue;
use partner_offline::store::{Collection, LocalStore};
use partner_offline::sync::{LAST_SYNC_AT_KEY, LAST_SYNC_ERROR_KEY};

#[derive(Parser, Debug)]
#[command(about = "Print pending mutations from the local store")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also print records with unsynced local changes
    #[arg(long)]
    unsynced: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let store = LocalStore::open(&cfg.database_url()).await?;

    let last_sync_at: Option<Value> = store.get_metadata(LAST_SYNC_AT_KEY).await?;
    let last_error: Option<String> = store.get_metadata(LAST_SYNC_ERROR_KEY).await?;
    println!("last sync:  {}", last_sync_at.unwrap_or(Value::Null));
    println!("last error: {}", last_error.as_deref().unwrap_or("-"));

    let pending = MutationQueue::new(store.clone()).list_pending().await?;
    println!("pending mutations: {}", pending.len());
    println!("{}", serde_json::to_string_pretty(&pending)?);

    if args.unsynced {
        for collection in [Collection::Records, Collection::Notifications] {
            let records: Vec<Record> = store
                .get_all_by_index(collection, "synced", &Value::Bool(false))
                .await?;
            println!("unsynced {}: {}", collection.name(), records.len());
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    store.close().await;
    Ok(())
}
