//! Box-side routes serving worker devices: registration, the assignment
//! read/write paths, the generic update legs, the balance summary, and
//! blob exchange for inputs and outputs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lapin::Channel;
use regex::Regex;
use serde::Deserialize;
use sqlx::{Pool, Postgres};
use tracing::{error, info, warn};
use uuid::Uuid;
use warp::Filter;

use crate::assignment;
use crate::blob;
use crate::http::RegisterWorkerRequest;
use crate::messaging::{ReplenishRequest, publish_replenish_request};
use crate::models::{KaryaFileRecord, MicrotaskAssignmentRecord, MicrotaskRecord, WorkerRecord};
use crate::sync::{self, TableUpdates};

use super::{
  authed_worker, bad_request, forbidden, internal, not_found, with_channel, with_db,
  with_files_dir,
};

#[derive(Debug, Deserialize)]
pub struct AssignmentsQuery {
  pub kind: String,
  pub from: String,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
  pub from: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutputFileQuery {
  pub name: String,
  pub checksum: String,
}

fn with_target(target: i64) -> impl Filter<Extract = (i64,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || target)
}

pub fn routes(
  db_pool: Pool<Postgres>,
  rabbit_channel: Channel,
  files_dir: PathBuf,
  preassign_target: i64,
  admin_key: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  register(db_pool.clone())
    .or(generate_access_codes(db_pool.clone(), admin_key))
    .or(get_assignments(db_pool.clone(), rabbit_channel, preassign_target))
    .or(submit_assignments(db_pool.clone()))
    .or(push_updates(db_pool.clone()))
    .or(pull_updates(db_pool.clone()))
    .or(summary(db_pool.clone()))
    .or(upload_output_file(db_pool.clone(), files_dir.clone()))
    .or(download_input_file(db_pool, files_dir))
}

fn valid_phone_number(input: &str) -> bool {
  let re = Regex::new(r"^\+?[0-9]{6,15}$").unwrap();
  re.is_match(input)
}

fn register(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "register")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(handle_register)
}

/// Bind a profile to a provisioned access code and hand out an id token.
/// The whole registration draft arrives in one request; re-registration
/// from the same phone re-issues the token for a reinstalled app.
async fn handle_register(
  request: RegisterWorkerRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let record: Option<WorkerRecord> = sqlx::query_as("SELECT * FROM worker WHERE access_code = $1")
    .bind(&request.access_code)
    .fetch_optional(&pool)
    .await
    .map_err(|_| internal("could not look up access code"))?;
  let Some(record) = record else {
    return Err(not_found("invalid access code"));
  };

  if record.id_token.is_some() && record.phone_number != request.phone_number {
    return Err(forbidden("access code already in use"));
  }
  if let Some(phone) = &request.phone_number {
    if !valid_phone_number(phone) {
      return Err(bad_request("invalid phone number"));
    }
  }

  let id_token = Uuid::new_v4().to_string();
  let registered: WorkerRecord = sqlx::query_as(
    "UPDATE worker
     SET id_token = $2, phone_number = $3, full_name = $4, year_of_birth = $5,
         gender = $6, app_language = $7, last_updated_at = now()
     WHERE id = $1 RETURNING *",
  )
  .bind(record.id)
  .bind(&id_token)
  .bind(&request.phone_number)
  .bind(&request.full_name)
  .bind(&request.year_of_birth)
  .bind(&request.gender)
  .bind(&request.app_language)
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("worker registration failed: {:?}", e);
    internal("could not register worker")
  })?;

  for skill in &request.skills {
    sqlx::query(
      "INSERT INTO worker_language_skill
         (box_id, worker_id, language, can_speak, can_read, can_type)
       VALUES ($1, $2, $3, $4, $5, $6)
       ON CONFLICT (worker_id, language) DO UPDATE
       SET can_speak = excluded.can_speak, can_read = excluded.can_read,
           can_type = excluded.can_type, last_updated_at = now()",
    )
    .bind(registered.box_id)
    .bind(registered.id)
    .bind(&skill.language)
    .bind(skill.can_speak)
    .bind(skill.can_read)
    .bind(skill.can_type)
    .execute(&pool)
    .await
    .map_err(|e| {
      error!("skill registration failed: {:?}", e);
      internal("could not register worker skills")
    })?;
  }

  info!("worker {} registered", registered.id);
  Ok(warp::reply::json(&registered))
}

#[derive(Debug, Deserialize)]
pub struct GenerateCodesRequest {
  pub count: u32,
}

fn generate_access_codes(
  db_pool: Pool<Postgres>,
  admin_key: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "codes")
    .and(warp::post())
    .and(warp::header::<String>(super::box_api::ADMIN_KEY_HEADER))
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(move |key: String, request: GenerateCodesRequest, pool: Pool<Postgres>| {
      let admin_key = admin_key.clone();
      async move {
        if key != admin_key {
          return Err(forbidden("invalid admin key"));
        }
        handle_generate_access_codes(request, pool).await
      }
    })
}

/// Provision unclaimed worker rows, one per access code. The box
/// operator hands the codes out; registration later binds a profile.
async fn handle_generate_access_codes(
  request: GenerateCodesRequest,
  pool: Pool<Postgres>,
) -> Result<warp::reply::Json, warp::Rejection> {
  let this_box: Option<i64> = sqlx::query_scalar("SELECT id FROM box ORDER BY id LIMIT 1")
    .fetch_optional(&pool)
    .await
    .map_err(|_| internal("could not look up box"))?;
  let Some(box_id) = this_box else {
    return Err(internal("box is not registered yet"));
  };

  let mut codes = Vec::with_capacity(request.count as usize);
  for _ in 0..request.count.min(1000) {
    let access_code = Uuid::new_v4().simple().to_string();
    sqlx::query("INSERT INTO worker (box_id, access_code) VALUES ($1, $2)")
      .bind(box_id)
      .bind(&access_code)
      .execute(&pool)
      .await
      .map_err(|e| {
        error!("access code creation failed: {:?}", e);
        internal("could not create access codes")
      })?;
    codes.push(access_code);
  }
  Ok(warp::reply::json(&codes))
}

fn get_assignments(
  db_pool: Pool<Postgres>,
  rabbit_channel: Channel,
  preassign_target: i64,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "assignments")
    .and(warp::get())
    .and(authed_worker(db_pool.clone()))
    .and(warp::query::<AssignmentsQuery>())
    .and(with_db(db_pool))
    .and(with_channel(rabbit_channel))
    .and(with_target(preassign_target))
    .and_then(handle_get_assignments)
}

async fn handle_get_assignments(
  worker: WorkerRecord,
  query: AssignmentsQuery,
  pool: Pool<Postgres>,
  channel: Channel,
  preassign_target: i64,
) -> Result<warp::reply::Json, warp::Rejection> {
  let since = DateTime::parse_from_rfc3339(&query.from)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|_| bad_request("invalid from timestamp"))?;

  match query.kind.as_str() {
    "verified" => {
      let records = assignment::get_verified_assignments(&pool, &worker, since)
        .await
        .map_err(|e| {
          error!("fetching verified assignments failed: {:?}", e);
          internal("could not fetch verified assignments")
        })?;
      Ok(warp::reply::json(&records))
    }
    "new" => {
      let bundle = assignment::get_new_assignments(&pool, &worker, since).await.map_err(|e| {
        error!("fetching assignments failed: {:?}", e);
        internal("could not fetch assignments")
      })?;

      // Queue a pool top-up for the next sync; strictly best-effort.
      let pooled = assignment::preassigned_count(&pool, worker.id).await.unwrap_or(0);
      let request = ReplenishRequest {
        worker_id: worker.id,
        deficit: (preassign_target - pooled).max(0),
      };
      if let Err(e) = publish_replenish_request(&channel, &request).await {
        warn!("could not enqueue replenishment for worker {}: {:?}", worker.id, e);
      }

      Ok(warp::reply::json(&bundle))
    }
    _ => Err(bad_request("invalid assignment kind")),
  }
}

fn submit_assignments(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "assignments")
    .and(warp::put())
    .and(authed_worker(db_pool.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(handle_submit_assignments)
}

async fn handle_submit_assignments(
  worker: WorkerRecord,
  reports: Vec<MicrotaskAssignmentRecord>,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let accepted = assignment::submit_assignments(&pool, worker.id, &reports).await.map_err(|e| {
    error!("submit from worker {} failed: {:?}", worker.id, e);
    internal("could not submit assignments")
  })?;
  Ok(warp::reply::json(&accepted))
}

fn push_updates(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "updates")
    .and(warp::put())
    .and(authed_worker(db_pool.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(handle_push_updates)
}

async fn handle_push_updates(
  worker: WorkerRecord,
  updates: Vec<TableUpdates>,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  sync::validate_worker_updates(worker.id, &updates).map_err(|e| forbidden(e.to_string()))?;
  let results = sync::apply_table_updates(&pool, &updates, sync::ApplyMode::Restamp).await.map_err(|e| {
    error!("applying updates from worker {} failed: {:?}", worker.id, e);
    bad_request("could not apply updates")
  })?;
  Ok(warp::reply::json(&results))
}

fn pull_updates(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "updates")
    .and(warp::get())
    .and(authed_worker(db_pool.clone()))
    .and(warp::query::<PullQuery>())
    .and(with_db(db_pool))
    .and_then(handle_pull_updates)
}

async fn handle_pull_updates(
  mut worker: WorkerRecord,
  query: PullQuery,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  // The device's own watermark, when supplied, beats the copy the box
  // last synced.
  if let Some(from) = &query.from {
    let from = DateTime::parse_from_rfc3339(from)
      .map(|t| t.with_timezone(&Utc))
      .map_err(|_| bad_request("invalid from timestamp"))?;
    worker.last_received_from_box_at = from;
  }
  let updates = sync::collect_updates_for_worker(&pool, &worker).await.map_err(|e| {
    error!("collecting updates for worker {} failed: {:?}", worker.id, e);
    internal("could not collect updates")
  })?;
  Ok(warp::reply::json(&updates))
}

fn summary(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "summary")
    .and(warp::get())
    .and(authed_worker(db_pool.clone()))
    .and(with_db(db_pool))
    .and_then(handle_summary)
}

async fn handle_summary(
  worker: WorkerRecord,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let summary = assignment::worker_summary(&pool, worker.id).await.map_err(|e| {
    error!("summary for worker {} failed: {:?}", worker.id, e);
    internal("could not compute summary")
  })?;
  Ok(warp::reply::json(&summary))
}

fn upload_output_file(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "assignments" / i64 / "output_file")
    .and(warp::post())
    .and(authed_worker(db_pool.clone()))
    .and(warp::query::<OutputFileQuery>())
    .and(warp::body::content_length_limit(256 * 1024 * 1024))
    .and(warp::body::bytes())
    .and(with_db(db_pool))
    .and(with_files_dir(files_dir))
    .and_then(handle_upload_output_file)
}

/// Receive an assignment output tarball and mint its karya_file record.
/// The assignment row itself is the worker's to update; it arrives
/// through the submit path.
async fn handle_upload_output_file(
  assignment_id: i64,
  worker: WorkerRecord,
  query: OutputFileQuery,
  body: bytes::Bytes,
  pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> Result<impl warp::Reply, warp::Rejection> {
  let assignment: Option<MicrotaskAssignmentRecord> =
    sqlx::query_as("SELECT * FROM microtask_assignment WHERE id = $1")
      .bind(assignment_id)
      .fetch_optional(&pool)
      .await
      .map_err(|_| internal("could not look up assignment"))?;
  let Some(assignment) = assignment else {
    return Err(not_found("no such assignment"));
  };
  if assignment.worker_id != worker.id {
    return Err(forbidden("assignment belongs to another worker"));
  }

  if blob::checksum_bytes(&body) != query.checksum {
    return Err(bad_request("checksum mismatch"));
  }

  let path = blob::blob_path(&files_dir, blob::ASSIGNMENT_OUTPUT, &query.name)
    .map_err(|_| internal("could not resolve file path"))?;
  tokio::fs::write(&path, &body).await.map_err(|e| {
    error!("storing output file for assignment {} failed: {:?}", assignment_id, e);
    internal("could not store file")
  })?;

  // A retried upload after a lost response returns the existing record.
  let existing: Option<KaryaFileRecord> = sqlx::query_as(
    "SELECT * FROM karya_file
     WHERE worker_id = $1 AND container_name = $2 AND name = $3",
  )
  .bind(worker.id)
  .bind(blob::ASSIGNMENT_OUTPUT)
  .bind(&query.name)
  .fetch_optional(&pool)
  .await
  .map_err(|_| internal("could not look up file record"))?;
  if let Some(existing) = existing {
    return Ok(warp::reply::json(&existing));
  }

  let record: KaryaFileRecord = sqlx::query_as(
    "INSERT INTO karya_file
       (box_id, worker_id, container_name, name, creator, checksum, in_box)
     VALUES ($1, $2, $3, $4, 'WORKER', $5, true)
     RETURNING *",
  )
  .bind(worker.box_id)
  .bind(worker.id)
  .bind(blob::ASSIGNMENT_OUTPUT)
  .bind(&query.name)
  .bind(&query.checksum)
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("creating karya_file for assignment {} failed: {:?}", assignment_id, e);
    internal("could not record file")
  })?;
  Ok(warp::reply::json(&record))
}

fn download_input_file(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "worker" / "microtasks" / i64 / "input_file")
    .and(warp::get())
    .and(authed_worker(db_pool.clone()))
    .and(with_db(db_pool))
    .and(with_files_dir(files_dir))
    .and_then(handle_download_input_file)
}

async fn handle_download_input_file(
  microtask_id: i64,
  worker: WorkerRecord,
  pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> Result<impl warp::Reply, warp::Rejection> {
  let bound: Option<i64> = sqlx::query_scalar(
    "SELECT id FROM microtask_assignment
     WHERE microtask_id = $1 AND worker_id = $2 LIMIT 1",
  )
  .bind(microtask_id)
  .bind(worker.id)
  .fetch_optional(&pool)
  .await
  .map_err(|_| internal("could not look up assignment"))?;
  if bound.is_none() {
    return Err(forbidden("microtask is not assigned to this worker"));
  }

  let microtask: Option<MicrotaskRecord> = sqlx::query_as("SELECT * FROM microtask WHERE id = $1")
    .bind(microtask_id)
    .fetch_optional(&pool)
    .await
    .map_err(|_| internal("could not look up microtask"))?;
  let Some(microtask) = microtask else {
    return Err(not_found("no such microtask"));
  };
  let Some(input_file_id) = microtask.input_file_id else {
    return Err(not_found("microtask has no input file"));
  };

  let record: Option<KaryaFileRecord> = sqlx::query_as("SELECT * FROM karya_file WHERE id = $1")
    .bind(input_file_id)
    .fetch_optional(&pool)
    .await
    .map_err(|_| internal("could not look up file record"))?;
  let Some(record) = record else {
    return Err(not_found("no karya_file record for input"));
  };

  let path = blob::blob_path(&files_dir, &record.container_name, &record.name)
    .map_err(|_| internal("could not resolve file path"))?;
  let bytes = tokio::fs::read(&path).await.map_err(|_| not_found("input payload not cached yet"))?;
  Ok(
    warp::http::Response::builder()
      .header("content-type", "application/octet-stream")
      .body(warp::hyper::Body::from(bytes))
      .map_err(|_| internal("could not build response"))?,
  )
}

#[cfg(test)]
mod tests {
  use super::valid_phone_number;

  #[test]
  fn phone_numbers_are_validated() {
    assert!(valid_phone_number("+919812345678"));
    assert!(valid_phone_number("9812345678"));
    assert!(!valid_phone_number("98-1234"));
    assert!(!valid_phone_number("12345"));
    assert!(!valid_phone_number("not a number"));
  }
}
