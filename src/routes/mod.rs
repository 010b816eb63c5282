use std::convert::Infallible;
use std::path::PathBuf;

use lapin::Channel;
use serde_json::json;
use sqlx::{Pool, Postgres};
use warp::Filter;
use warp::http::StatusCode;

use crate::http::{BOX_ID_HEADER, ID_TOKEN_HEADER, WORKER_ID_HEADER};
use crate::models::{BoxRecord, WorkerRecord};

pub mod box_api;
pub mod worker_api;

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

pub fn api_error(status: StatusCode, message: impl Into<String>) -> warp::Rejection {
  warp::reject::custom(ApiError { status, message: message.into() })
}

pub fn bad_request(message: impl Into<String>) -> warp::Rejection {
  api_error(StatusCode::BAD_REQUEST, message)
}

pub fn forbidden(message: impl Into<String>) -> warp::Rejection {
  api_error(StatusCode::FORBIDDEN, message)
}

pub fn not_found(message: impl Into<String>) -> warp::Rejection {
  api_error(StatusCode::NOT_FOUND, message)
}

pub fn internal(message: impl Into<String>) -> warp::Rejection {
  api_error(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// All routes served by the central server. Callers chain any extra
/// routes before applying `handle_rejection`.
pub fn server_routes(
  db_pool: Pool<Postgres>,
  files_dir: PathBuf,
  admin_key: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  box_api::routes(db_pool, files_dir, admin_key)
}

/// All routes served by a box.
pub fn box_routes(
  db_pool: Pool<Postgres>,
  rabbit_channel: Channel,
  files_dir: PathBuf,
  preassign_target: i64,
  admin_key: String,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  worker_api::routes(db_pool, rabbit_channel, files_dir, preassign_target, admin_key)
}

pub fn with_db(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = (Pool<Postgres>,), Error = Infallible> + Clone {
  warp::any().map(move || db_pool.clone())
}

pub fn with_channel(channel: Channel) -> impl Filter<Extract = (Channel,), Error = Infallible> + Clone {
  warp::any().map(move || channel.clone())
}

pub fn with_files_dir(files_dir: PathBuf) -> impl Filter<Extract = (PathBuf,), Error = Infallible> + Clone {
  warp::any().map(move || files_dir.clone())
}

/// Header authentication for a box calling the server.
pub fn authed_box(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = (BoxRecord,), Error = warp::Rejection> + Clone {
  warp::header::<i64>(BOX_ID_HEADER)
    .and(warp::header::<String>(ID_TOKEN_HEADER))
    .and(with_db(db_pool))
    .and_then(|box_id: i64, token: String, pool: Pool<Postgres>| async move {
      let record: Option<BoxRecord> = sqlx::query_as("SELECT * FROM box WHERE id = $1")
        .bind(box_id)
        .fetch_optional(&pool)
        .await
        .map_err(|_| internal("could not authenticate box"))?;
      match record {
        Some(record) if record.key.as_deref() == Some(token.as_str()) => Ok(record),
        _ => Err(forbidden("invalid box credentials")),
      }
    })
}

/// Header authentication for a worker device calling its box.
pub fn authed_worker(
  db_pool: Pool<Postgres>,
) -> impl Filter<Extract = (WorkerRecord,), Error = warp::Rejection> + Clone {
  warp::header::<i64>(WORKER_ID_HEADER)
    .and(warp::header::<String>(ID_TOKEN_HEADER))
    .and(with_db(db_pool))
    .and_then(|worker_id: i64, token: String, pool: Pool<Postgres>| async move {
      let record: Option<WorkerRecord> = sqlx::query_as("SELECT * FROM worker WHERE id = $1")
        .bind(worker_id)
        .fetch_optional(&pool)
        .await
        .map_err(|_| internal("could not authenticate worker"))?;
      match record {
        Some(record) if record.id_token.as_deref() == Some(token.as_str()) => Ok(record),
        _ => Err(forbidden("invalid worker credentials")),
      }
    })
}

/// Fold rejections into a small JSON error body; internal detail stays in
/// the logs.
pub async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(api) = err.find::<ApiError>() {
    (api.status, api.message.clone())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "no such route".to_string())
  } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
    (StatusCode::BAD_REQUEST, "malformed request body".to_string())
  } else if err.find::<warp::reject::MissingHeader>().is_some() {
    (StatusCode::UNAUTHORIZED, "missing credentials".to_string())
  } else {
    tracing::error!("unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(
    warp::reply::json(&json!({ "error": message })),
    status,
  ))
}
