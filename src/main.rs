use warp::Filter;
use karya::{config::ServerConfig, database::setup_database, routes::{handle_rejection, server_routes}};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = ServerConfig::from_env();
  let db_pool = setup_database(&config.database_url).await;

  let api = server_routes(db_pool, config.files_dir.clone().into(), config.admin_key.clone())
    .or(warp::path("health").map(|| "ok"))
    .recover(handle_rejection);

  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
}
