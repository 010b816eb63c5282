use std::time::Duration;

use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tracing::error;
use warp::Filter;

use karya::assignment::expire_overdue_assignments;
use karya::box_sync::{ensure_registered, sync_with_server};
use karya::config::BoxConfig;
use karya::database::setup_database;
use karya::messaging::{create_rabbit_channel, declare_replenish_queue};
use karya::replenish;
use karya::routes::box_routes;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = BoxConfig::from_env();
  let db_pool = setup_database(&config.database_url).await;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .expect("Failed to create RabbitMQ channel");
  declare_replenish_queue(&rabbit_channel)
    .await
    .expect("Failed to declare replenish queue");

  let this_box = ensure_registered(&db_pool, &config)
    .await
    .expect("Failed to register box with the server");

  {
    let pool = db_pool.clone();
    let channel = rabbit_channel.clone();
    let max_credits = config.max_preassign_credits;
    tokio::spawn(async move {
      if let Err(e) = replenish::run_consumer(pool, channel, max_credits, 4).await {
        error!("replenish consumer stopped: {:?}", e);
      }
    });
  }

  {
    let pool = db_pool.clone();
    let box_id = this_box.id;
    let mut ticks =
      IntervalStream::new(tokio::time::interval(Duration::from_secs(config.expiry_interval_secs)));
    tokio::spawn(async move {
      while ticks.next().await.is_some() {
        if let Err(e) = expire_overdue_assignments(&pool, box_id).await {
          error!("expiry sweep failed: {:?}", e);
        }
      }
    });
  }

  {
    let pool = db_pool.clone();
    let cron_config = config.clone();
    let mut ticks =
      IntervalStream::new(tokio::time::interval(Duration::from_secs(config.sync_interval_secs)));
    tokio::spawn(async move {
      while ticks.next().await.is_some() {
        if let Err(e) = sync_with_server(&pool, &cron_config).await {
          error!("sync round with server failed: {:?}", e);
        }
      }
    });
  }

  let api = box_routes(
    db_pool,
    rabbit_channel,
    config.files_dir.clone().into(),
    config.preassign_target,
    config.admin_key.clone(),
  )
  .or(warp::path("health").map(|| "ok"))
  .recover(karya::routes::handle_rejection);

  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
}
