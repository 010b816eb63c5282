use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::watch;
use tracing::{error, info, warn};

use karya::config::ClientConfig;
use karya::database::setup_database;
use karya::http::ApiClient;
use karya::orchestrator::{SyncContext, bootstrap_local_store, run_sync_pass};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = ClientConfig::from_env();
  let db_pool = setup_database(&config.database_url).await;
  let api = ApiClient::for_worker(&config.box_url, config.worker_id, &config.id_token);

  let (progress_tx, mut progress_rx) = watch::channel(0u8);
  let printer = tokio::spawn(async move {
    while progress_rx.changed().await.is_ok() {
      let value = *progress_rx.borrow();
      info!("sync progress: {}%", value);
    }
  });

  let ctx = SyncContext {
    pool: db_pool,
    api,
    worker_id: config.worker_id,
    files_dir: config.files_dir.clone().into(),
    cancelled: Arc::new(AtomicBool::new(false)),
    progress: progress_tx,
  };

  if let Err(e) = bootstrap_local_store(&ctx).await {
    error!("could not bootstrap local store: {:?}", e);
    std::process::exit(1);
  }

  match run_sync_pass(&ctx).await {
    Ok(outcome) => {
      if let Some(warning) = &outcome.warning {
        warn!("{}", warning);
      }
      if let Some(summary) = &outcome.summary {
        info!("balance: {:.1} credits", summary.balance);
      }
      if outcome.cancelled {
        info!("sync cancelled; completed phases remain applied");
      } else {
        info!("sync complete");
      }
    }
    Err(e) => {
      error!("{}", e);
      std::process::exit(1);
    }
  }
  printer.abort();
}
