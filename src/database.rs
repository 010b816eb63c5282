use sqlx::{Pool, Postgres};
use sqlx::migrate::Migrator;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Connect and migrate. Boxes and worker devices come up while their
/// network is still settling, so the initial connection is retried with
/// backoff before giving up.
pub async fn setup_database(database_url: &str) -> Pool<Postgres> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(200).take(5), || {
    Pool::<Postgres>::connect(database_url)
  })
  .await
  .expect("Failed to connect to database.");

  MIGRATOR.run(&pool)
    .await
    .expect("Failed to run database migrations.");
  info!("Database migrations complete");
  pool
}
