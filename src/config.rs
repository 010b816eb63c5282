use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub database_url: String,
  pub server_port: u16,
  pub files_dir: String,
  pub admin_key: String,
}

impl ServerConfig {
  pub fn from_env() -> Self {
    Self {
      database_url: env::var("DATABASE_URL").unwrap(),
      server_port: port_from_env("SERVER_PORT", 8080),
      files_dir: env::var("FILES_DIR").unwrap_or_else(|_| "files".into()),
      admin_key: env::var("ADMIN_KEY").unwrap(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct BoxConfig {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub files_dir: String,
  pub server_url: String,
  pub creation_code: String,
  pub name: String,
  pub admin_key: String,
  pub sync_interval_secs: u64,
  pub expiry_interval_secs: u64,
  pub max_preassign_credits: f32,
  pub preassign_target: i64,
}

impl BoxConfig {
  pub fn from_env() -> Self {
    Self {
      database_url: env::var("DATABASE_URL").unwrap(),
      rabbitmq_url: env::var("RABBITMQ_URL").unwrap(),
      server_port: port_from_env("SERVER_PORT", 8081),
      files_dir: env::var("FILES_DIR").unwrap_or_else(|_| "files".into()),
      server_url: env::var("SERVER_URL").unwrap(),
      creation_code: env::var("BOX_CREATION_CODE").unwrap(),
      name: env::var("BOX_NAME").unwrap_or_else(|_| "karya-box".into()),
      admin_key: env::var("ADMIN_KEY").unwrap(),
      sync_interval_secs: u64_from_env("SYNC_INTERVAL_SECS", 900),
      expiry_interval_secs: u64_from_env("EXPIRY_INTERVAL_SECS", 3600),
      max_preassign_credits: env::var("MAX_PREASSIGN_CREDITS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000.0),
      preassign_target: env::var("PREASSIGN_TARGET")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub database_url: String,
  pub box_url: String,
  pub files_dir: String,
  pub worker_id: i64,
  pub id_token: String,
}

impl ClientConfig {
  pub fn from_env() -> Self {
    Self {
      database_url: env::var("DATABASE_URL").unwrap(),
      box_url: env::var("BOX_URL").unwrap(),
      files_dir: env::var("FILES_DIR").unwrap_or_else(|_| "files".into()),
      worker_id: env::var("WORKER_ID")
        .unwrap()
        .parse()
        .expect("WORKER_ID must be an integer"),
      id_token: env::var("ID_TOKEN").unwrap(),
    }
  }
}

fn port_from_env(key: &str, default: u16) -> u16 {
  env::var(key)
    .unwrap_or_else(|_| default.to_string())
    .parse()
    .unwrap_or(default)
}

fn u64_from_env(key: &str, default: u64) -> u64 {
  env::var(key)
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(default)
}
