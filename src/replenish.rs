//! Background replenishment of preassignment pools. Requests arrive on
//! the RabbitMQ queue after a worker syncs; a consumer pool drains them
//! ordered by pool deficit so the emptiest workers are served first.
//! Everything here is best-effort: an error is logged and the worker is
//! simply retried on its next sync.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::StreamExt;
use lapin::{Channel, options::{BasicAckOptions, BasicConsumeOptions}, types::FieldTable};
use sqlx::{Pool, Postgres};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tracing::{error, info};

use crate::assignment::preassign_microtasks_for_worker;
use crate::messaging::{REPLENISH_QUEUE, ReplenishRequest};
use crate::models::WorkerRecord;

#[derive(Debug)]
struct QueuedRequest {
  request: ReplenishRequest,
}

impl Eq for QueuedRequest {}

impl PartialEq for QueuedRequest {
  fn eq(&self, other: &Self) -> bool {
    self.request.deficit == other.request.deficit
  }
}

impl PartialOrd for QueuedRequest {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueuedRequest {
  fn cmp(&self, other: &Self) -> Ordering {
    self.request.deficit.cmp(&other.request.deficit)
  }
}

pub struct Scheduler {
  queue: Mutex<BinaryHeap<QueuedRequest>>,
}

impl Scheduler {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
    }
  }

  pub async fn add(&self, request: ReplenishRequest) {
    self.queue.lock().await.push(QueuedRequest { request });
  }

  pub async fn next(&self) -> Option<ReplenishRequest> {
    self.queue.lock().await.pop().map(|q| q.request)
  }
}

impl Default for Scheduler {
  fn default() -> Self {
    Self::new()
  }
}

/// Consume replenishment requests forever. Spawned once per box process.
pub async fn run_consumer(
  pool: Pool<Postgres>,
  channel: Channel,
  max_credits: f32,
  concurrency: usize,
) -> anyhow::Result<()> {
  let mut consumer = channel
    .basic_consume(
      REPLENISH_QUEUE,
      "replenish_consumer",
      BasicConsumeOptions::default(),
      FieldTable::default(),
    )
    .await?;

  let scheduler = Arc::new(Scheduler::new());
  let semaphore = Arc::new(Semaphore::new(concurrency));

  let feeder = scheduler.clone();
  tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      match delivery {
        Ok(delivery) => {
          match serde_json::from_slice::<ReplenishRequest>(&delivery.data) {
            Ok(request) => feeder.add(request).await,
            Err(e) => error!("unparseable replenish request: {:?}", e),
          }
          // Ack either way: a lost request is re-published on the
          // worker's next sync.
          let _ = delivery.ack(BasicAckOptions::default()).await;
        }
        Err(e) => error!("replenish consumer error: {:?}", e),
      }
    }
  });

  loop {
    if let Some(request) = scheduler.next().await {
      let permit = semaphore.clone().acquire_owned().await?;
      let pool = pool.clone();
      tokio::spawn(async move {
        replenish_worker(&pool, request.worker_id, max_credits).await;
        drop(permit);
      });
    } else {
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
  }
}

async fn replenish_worker(pool: &Pool<Postgres>, worker_id: i64, max_credits: f32) {
  let worker: Result<Option<WorkerRecord>, _> =
    sqlx::query_as("SELECT * FROM worker WHERE id = $1")
      .bind(worker_id)
      .fetch_optional(pool)
      .await;

  match worker {
    Ok(Some(worker)) => {
      match preassign_microtasks_for_worker(pool, &worker, max_credits).await {
        Ok(count) if count > 0 => {
          info!("replenished worker {} with {} microtasks", worker_id, count);
        }
        Ok(_) => {}
        Err(e) => error!("replenishment failed for worker {}: {:?}", worker_id, e),
      }
    }
    Ok(None) => error!("replenish request for unknown worker {}", worker_id),
    Err(e) => error!("could not load worker {}: {:?}", worker_id, e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn emptier_pools_drain_first() {
    let scheduler = Scheduler::new();
    scheduler.add(ReplenishRequest { worker_id: 1, deficit: 3 }).await;
    scheduler.add(ReplenishRequest { worker_id: 2, deficit: 20 }).await;
    scheduler.add(ReplenishRequest { worker_id: 3, deficit: 8 }).await;

    assert_eq!(scheduler.next().await.unwrap().worker_id, 2);
    assert_eq!(scheduler.next().await.unwrap().worker_id, 3);
    assert_eq!(scheduler.next().await.unwrap().worker_id, 1);
    assert!(scheduler.next().await.is_none());
  }
}
