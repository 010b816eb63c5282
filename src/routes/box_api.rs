//! Server-side routes: box provisioning and checkin, the two update legs
//! of the box sync, blob exchange, and the small admin surface that feeds
//! tasks into the system.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use sqlx::{Pool, Postgres};
use tracing::{error, info};
use uuid::Uuid;
use warp::Filter;

use crate::assignment;
use crate::blob;
use crate::http::{RegisterBoxRequest, UploadFileQuery};
use crate::models::{BoxRecord, KaryaFileRecord, MicrotaskRecord, TaskAssignmentRecord, TaskRecord};
use crate::sync::{self, TableUpdates};

use super::{
  authed_box, bad_request, forbidden, internal, not_found, with_db, with_files_dir,
};

pub const ADMIN_KEY_HEADER: &str = "karya-admin-key";

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
  pub from: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBoxRequest {
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
  pub scenario_name: String,
  pub language: String,
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default = "empty_object")]
  pub params: serde_json::Value,
  pub budget: Option<f32>,
  pub deadline: Option<DateTime<Utc>>,
  pub assignment_granularity: Option<crate::models::AssignmentGranularity>,
  pub group_assignment_order: Option<crate::models::AssignmentOrder>,
  pub microtask_assignment_order: Option<crate::models::AssignmentOrder>,
}

#[derive(Debug, Deserialize)]
pub struct MicrotaskDraft {
  pub group_id: Option<i64>,
  #[serde(default = "empty_object")]
  pub input: serde_json::Value,
  pub input_file_id: Option<i64>,
  pub deadline: Option<DateTime<Utc>>,
  pub credits: f32,
}

#[derive(Debug, Deserialize)]
pub struct CreateMicrotasksRequest {
  pub task_id: i64,
  pub microtasks: Vec<MicrotaskDraft>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskAssignmentRequest {
  pub task_id: i64,
  pub box_id: i64,
  pub policy: Option<String>,
  #[serde(default = "empty_object")]
  pub params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
  pub ids: Vec<i64>,
}

fn empty_object() -> serde_json::Value {
  serde_json::json!({})
}

fn parse_since(query: &SinceQuery) -> Result<DateTime<Utc>, warp::Rejection> {
  DateTime::parse_from_rfc3339(&query.from)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|_| bad_request("invalid from timestamp"))
}

pub fn routes(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
  admin_key: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  register(db_pool.clone())
    .or(checkin(db_pool.clone()))
    .or(receive_updates(db_pool.clone()))
    .or(send_updates(db_pool.clone()))
    .or(upload_file(db_pool.clone(), files_dir.clone()))
    .or(download_file(db_pool.clone(), files_dir.clone()))
    .or(admin_routes(db_pool, files_dir, admin_key))
}

fn register(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "box" / "register")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(handle_register)
}

async fn handle_register(
  request: RegisterBoxRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let record: Option<BoxRecord> = sqlx::query_as("SELECT * FROM box WHERE creation_code = $1")
    .bind(&request.creation_code)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
      error!("box lookup failed: {:?}", e);
      internal("could not register box")
    })?;
  let Some(record) = record else {
    return Err(not_found("invalid creation code"));
  };
  if record.key.is_some() {
    return Err(forbidden("creation code already used"));
  }

  let key = Uuid::new_v4().to_string();
  let registered: BoxRecord = sqlx::query_as(
    "UPDATE box SET name = $2, url = $3, key = $4, last_updated_at = now()
     WHERE id = $1 RETURNING *",
  )
  .bind(record.id)
  .bind(&request.name)
  .bind(&request.url)
  .bind(&key)
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("box registration failed: {:?}", e);
    internal("could not register box")
  })?;

  info!("box {} registered", registered.id);
  Ok(warp::reply::json(&registered))
}

fn checkin(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "box" / "checkin")
    .and(warp::put())
    .and(authed_box(db_pool.clone()))
    .and(with_db(db_pool))
    .and_then(handle_checkin)
}

async fn handle_checkin(
  this_box: BoxRecord,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let key = Uuid::new_v4().to_string();
  sqlx::query("UPDATE box SET key = $2, last_updated_at = now() WHERE id = $1")
    .bind(this_box.id)
    .bind(&key)
    .execute(&pool)
    .await
    .map_err(|e| {
      error!("checkin failed for box {}: {:?}", this_box.id, e);
      internal("could not renew session")
    })?;
  Ok(warp::reply::json(&crate::http::CheckinResponse { key }))
}

fn receive_updates(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "box" / "updates")
    .and(warp::put())
    .and(authed_box(db_pool.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(handle_receive_updates)
}

async fn handle_receive_updates(
  this_box: BoxRecord,
  updates: Vec<TableUpdates>,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  sync::validate_box_updates(this_box.id, &updates).map_err(|e| forbidden(e.to_string()))?;
  let results = sync::apply_table_updates(&pool, &updates, sync::ApplyMode::Restamp).await.map_err(|e| {
    error!("applying updates from box {} failed: {:?}", this_box.id, e);
    bad_request("could not apply updates")
  })?;
  Ok(warp::reply::json(&results))
}

fn send_updates(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "box" / "updates")
    .and(warp::get())
    .and(authed_box(db_pool.clone()))
    .and(warp::query::<SinceQuery>())
    .and(with_db(db_pool))
    .and_then(handle_send_updates)
}

async fn handle_send_updates(
  this_box: BoxRecord,
  query: SinceQuery,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let since = parse_since(&query)?;
  let updates = sync::collect_updates_for_box(&pool, this_box.id, since).await.map_err(|e| {
    error!("collecting updates for box {} failed: {:?}", this_box.id, e);
    internal("could not collect updates")
  })?;
  Ok(warp::reply::json(&updates))
}

fn upload_file(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "karya_file")
    .and(warp::post())
    .and(authed_box(db_pool.clone()))
    .and(warp::query::<UploadFileQuery>())
    .and(warp::body::content_length_limit(256 * 1024 * 1024))
    .and(warp::body::bytes())
    .and(with_db(db_pool))
    .and(with_files_dir(files_dir))
    .and_then(handle_upload_file)
}

/// Store the payload for a karya_file row the box has already pushed
/// through the updates leg, and flip its server presence flag.
async fn handle_upload_file(
  this_box: BoxRecord,
  query: UploadFileQuery,
  body: bytes::Bytes,
  pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> Result<impl warp::Reply, warp::Rejection> {
  let record: Option<KaryaFileRecord> = sqlx::query_as(
    "SELECT * FROM karya_file WHERE box_id = $1 AND container_name = $2 AND name = $3",
  )
  .bind(this_box.id)
  .bind(&query.container)
  .bind(&query.name)
  .fetch_optional(&pool)
  .await
  .map_err(|_| internal("could not look up file record"))?;
  let Some(record) = record else {
    return Err(not_found("no karya_file record for this payload"));
  };

  if blob::checksum_bytes(&body) != record.checksum || query.checksum != record.checksum {
    return Err(bad_request("checksum mismatch"));
  }

  let path = blob::blob_path(&files_dir, &record.container_name, &record.name)
    .map_err(|_| internal("could not resolve file path"))?;
  tokio::fs::write(&path, &body).await.map_err(|e| {
    error!("writing karya file {} failed: {:?}", record.id, e);
    internal("could not store file")
  })?;

  let updated: KaryaFileRecord = sqlx::query_as(
    "UPDATE karya_file SET in_server = true, last_updated_at = now()
     WHERE id = $1 RETURNING *",
  )
  .bind(record.id)
  .fetch_one(&pool)
  .await
  .map_err(|_| internal("could not update file record"))?;
  Ok(warp::reply::json(&updated))
}

fn download_file(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("api" / "karya_file" / i64)
    .and(warp::get())
    .and(authed_box(db_pool.clone()))
    .and(with_db(db_pool))
    .and(with_files_dir(files_dir))
    .and_then(handle_download_file)
}

async fn handle_download_file(
  file_id: i64,
  this_box: BoxRecord,
  pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> Result<impl warp::Reply, warp::Rejection> {
  let record: Option<KaryaFileRecord> = sqlx::query_as("SELECT * FROM karya_file WHERE id = $1")
    .bind(file_id)
    .fetch_optional(&pool)
    .await
    .map_err(|_| internal("could not look up file record"))?;
  let Some(record) = record else {
    return Err(not_found("no such file"));
  };
  // Boxes may fetch server-created input files and their own artifacts,
  // never another box's.
  if record.box_id.is_some() && record.box_id != Some(this_box.id) {
    return Err(forbidden("file belongs to another box"));
  }
  if !record.in_server {
    return Err(not_found("file payload not present at server"));
  }

  let path = blob::blob_path(&files_dir, &record.container_name, &record.name)
    .map_err(|_| internal("could not resolve file path"))?;
  let bytes = tokio::fs::read(&path).await.map_err(|_| not_found("file payload missing"))?;
  Ok(
    warp::http::Response::builder()
      .header("content-type", "application/octet-stream")
      .body(warp::hyper::Body::from(bytes))
      .map_err(|_| internal("could not build response"))?,
  )
}

fn admin_auth(admin_key: String) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
  warp::header::<String>(ADMIN_KEY_HEADER)
    .and_then(move |key: String| {
      let admin_key = admin_key.clone();
      async move {
        if key == admin_key {
          Ok(())
        } else {
          Err(forbidden("invalid admin key"))
        }
      }
    })
    .untuple_one()
}

/// Minimal requester surface: provision boxes, feed in tasks and their
/// microtasks, route tasks to boxes, verify submitted work. The full
/// admin console lives elsewhere.
fn admin_routes(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
  admin_key: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let create_box = warp::path!("api" / "admin" / "box")
    .and(warp::post())
    .and(admin_auth(admin_key.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool.clone()))
    .and_then(handle_create_box);

  let create_task = warp::path!("api" / "admin" / "task")
    .and(warp::post())
    .and(admin_auth(admin_key.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool.clone()))
    .and_then(handle_create_task);

  let create_microtasks = warp::path!("api" / "admin" / "microtasks")
    .and(warp::post())
    .and(admin_auth(admin_key.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool.clone()))
    .and_then(handle_create_microtasks);

  let create_task_assignment = warp::path!("api" / "admin" / "task_assignment")
    .and(warp::post())
    .and(admin_auth(admin_key.clone()))
    .and(warp::body::json())
    .and(with_db(db_pool.clone()))
    .and_then(handle_create_task_assignment);

  let upload_input_file = warp::path!("api" / "admin" / "karya_file")
    .and(warp::post())
    .and(admin_auth(admin_key.clone()))
    .and(warp::query::<UploadFileQuery>())
    .and(warp::body::content_length_limit(256 * 1024 * 1024))
    .and(warp::body::bytes())
    .and(with_db(db_pool.clone()))
    .and(with_files_dir(files_dir))
    .and_then(handle_admin_upload_file);

  let verify = warp::path!("api" / "admin" / "assignments" / "verify")
    .and(warp::put())
    .and(admin_auth(admin_key))
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and_then(handle_verify);

  create_box
    .or(create_task)
    .or(create_microtasks)
    .or(create_task_assignment)
    .or(upload_input_file)
    .or(verify)
}

/// Server-created input blob: store the payload and mint its record in
/// one step. Microtasks reference the returned id.
async fn handle_admin_upload_file(
  query: UploadFileQuery,
  body: bytes::Bytes,
  pool: Pool<Postgres>,
  files_dir: PathBuf,
) -> Result<impl warp::Reply, warp::Rejection> {
  if blob::checksum_bytes(&body) != query.checksum {
    return Err(bad_request("checksum mismatch"));
  }
  let path = blob::blob_path(&files_dir, &query.container, &query.name)
    .map_err(|_| internal("could not resolve file path"))?;
  tokio::fs::write(&path, &body).await.map_err(|e| {
    error!("writing input file failed: {:?}", e);
    internal("could not store file")
  })?;

  let record: KaryaFileRecord = sqlx::query_as(
    "INSERT INTO karya_file (container_name, name, creator, checksum, in_server)
     VALUES ($1, $2, 'SERVER', $3, true)
     RETURNING *",
  )
  .bind(&query.container)
  .bind(&query.name)
  .bind(&query.checksum)
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("creating karya_file failed: {:?}", e);
    internal("could not record file")
  })?;
  Ok(warp::reply::json(&record))
}

async fn handle_create_box(
  request: CreateBoxRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let creation_code = Uuid::new_v4().to_string();
  let record: BoxRecord = sqlx::query_as(
    "INSERT INTO box (creation_code, name) VALUES ($1, $2) RETURNING *",
  )
  .bind(&creation_code)
  .bind(&request.name)
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("box creation failed: {:?}", e);
    internal("could not create box")
  })?;
  Ok(warp::reply::json(&record))
}

async fn handle_create_task(
  request: CreateTaskRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  use crate::models::{AssignmentGranularity, AssignmentOrder};
  let record: TaskRecord = sqlx::query_as(
    "INSERT INTO task
       (scenario_name, language, name, description, params, budget, deadline,
        assignment_granularity, group_assignment_order, microtask_assignment_order, status)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'APPROVED')
     RETURNING *",
  )
  .bind(&request.scenario_name)
  .bind(&request.language)
  .bind(&request.name)
  .bind(&request.description)
  .bind(&request.params)
  .bind(request.budget)
  .bind(request.deadline)
  .bind(request.assignment_granularity.unwrap_or(AssignmentGranularity::Microtask))
  .bind(request.group_assignment_order.unwrap_or(AssignmentOrder::Sequential))
  .bind(request.microtask_assignment_order.unwrap_or(AssignmentOrder::Sequential))
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("task creation failed: {:?}", e);
    internal("could not create task")
  })?;
  Ok(warp::reply::json(&record))
}

async fn handle_create_microtasks(
  request: CreateMicrotasksRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let mut created: Vec<MicrotaskRecord> = Vec::with_capacity(request.microtasks.len());
  for draft in &request.microtasks {
    let record: MicrotaskRecord = sqlx::query_as(
      "INSERT INTO microtask (task_id, group_id, input, input_file_id, deadline, credits)
       VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(request.task_id)
    .bind(draft.group_id)
    .bind(&draft.input)
    .bind(draft.input_file_id)
    .bind(draft.deadline)
    .bind(draft.credits)
    .fetch_one(&pool)
    .await
    .map_err(|e| {
      error!("microtask creation failed: {:?}", e);
      internal("could not create microtasks")
    })?;
    created.push(record);
  }
  Ok(warp::reply::json(&created))
}

async fn handle_create_task_assignment(
  request: CreateTaskAssignmentRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let record: TaskAssignmentRecord = sqlx::query_as(
    "INSERT INTO task_assignment (task_id, box_id, policy, params)
     VALUES ($1, $2, $3, $4) RETURNING *",
  )
  .bind(request.task_id)
  .bind(request.box_id)
  .bind(request.policy.as_deref().unwrap_or("default"))
  .bind(&request.params)
  .fetch_one(&pool)
  .await
  .map_err(|e| {
    error!("task assignment creation failed: {:?}", e);
    internal("could not create task assignment")
  })?;
  sqlx::query("UPDATE task SET status = 'ASSIGNED', last_updated_at = now() WHERE id = $1")
    .bind(request.task_id)
    .execute(&pool)
    .await
    .map_err(|_| internal("could not update task status"))?;
  Ok(warp::reply::json(&record))
}

async fn handle_verify(
  request: VerifyRequest,
  pool: Pool<Postgres>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let verified = assignment::verify_assignments(&pool, &request.ids).await.map_err(|e| {
    error!("verification failed: {:?}", e);
    internal("could not verify assignments")
  })?;
  Ok(warp::reply::json(&serde_json::json!({ "verified": verified })))
}
