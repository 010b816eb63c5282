use lapin::{Connection, ConnectionProperties, Channel, options::{BasicPublishOptions, QueueDeclareOptions}, types::FieldTable, BasicProperties};
use serde::{Serialize, Deserialize};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;
use anyhow::Result;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Queue carrying preassignment-pool replenishment requests.
pub const REPLENISH_QUEUE: &str = "replenish_queue";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplenishRequest {
  pub worker_id: i64,
  /// How far below target the worker's pool is; emptier pools drain first.
  pub deficit: i64,
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn declare_replenish_queue(channel: &Channel) -> Result<()> {
  channel
    .queue_declare(REPLENISH_QUEUE, QueueDeclareOptions::default(), FieldTable::default())
    .await?;
  Ok(())
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel.basic_publish("", queue, BasicPublishOptions::default(), payload, BasicProperties::default()).await
  })
    .await?;
  Ok(())
}

pub async fn publish_replenish_request(channel: &Channel, request: &ReplenishRequest) -> Result<()> {
  let payload = serde_json::to_vec(request)?;
  publish_message(channel, REPLENISH_QUEUE, &payload).await
}
