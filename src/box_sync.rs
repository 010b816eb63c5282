//! Periodic box -> server synchronization: checkin, upload pending blobs,
//! push owned updates, pull new task material, download input blobs. Each
//! stage logs its outcome; losing connectivity midway leaves the
//! watermarks untouched for the stages that did not finish.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Postgres};
use tracing::{info, warn};

use crate::blob;
use crate::config::BoxConfig;
use crate::http::{self, ApiClient, RegisterBoxRequest, UploadFileQuery};
use crate::models::{BoxRecord, KaryaFileRecord};
use crate::sync;

/// Load the local box record, registering with the server on first run.
pub async fn ensure_registered(pool: &Pool<Postgres>, config: &BoxConfig) -> Result<BoxRecord> {
  let existing: Option<BoxRecord> =
    sqlx::query_as("SELECT * FROM box ORDER BY id LIMIT 1").fetch_optional(pool).await?;
  if let Some(this_box) = existing {
    return Ok(this_box);
  }

  let registered = http::register_box(
    &config.server_url,
    &RegisterBoxRequest {
      creation_code: config.creation_code.clone(),
      name: config.name.clone(),
      url: None,
    },
  )
  .await
  .context("first-run box registration")?;
  info!("registered box {} with the server", registered.id);

  sync::upsert_record(pool, sync::UpdatableTable::Box, &serde_json::to_value(&registered)?)
    .await?;
  Ok(registered)
}

/// One full sync round with the server. An unreachable server is normal
/// for an intermittently connected box and ends the round quietly.
pub async fn sync_with_server(
  pool: &Pool<Postgres>,
  config: &BoxConfig,
) -> Result<()> {
  let this_box: BoxRecord = sqlx::query_as("SELECT * FROM box ORDER BY id LIMIT 1")
    .fetch_one(pool)
    .await
    .context("box is not registered yet")?;

  let key = this_box.key.clone().unwrap_or_default();
  let mut api = ApiClient::for_box(&config.server_url, this_box.id, &key);

  let renewed = match api.checkin().await {
    Ok(response) => response,
    Err(e) => {
      info!("no connection to the server, skipping sync round: {:?}", e);
      return Ok(());
    }
  };
  api.set_token(renewed.key.clone());
  sqlx::query("UPDATE box SET key = $2, last_updated_at = now() WHERE id = $1")
    .bind(this_box.id)
    .bind(&renewed.key)
    .execute(pool)
    .await?;
  // Re-read so the pushed box row carries the renewed key, not the one
  // the server just rotated away.
  let this_box: BoxRecord = sqlx::query_as("SELECT * FROM box WHERE id = $1")
    .bind(this_box.id)
    .fetch_one(pool)
    .await?;

  // Records travel before payloads: the server only accepts a blob for a
  // karya_file row it already holds.
  let send_time = Utc::now();
  let updates = sync::collect_updates_for_server(pool, &this_box).await?;
  match api.push_box_updates(&updates).await {
    Ok(results) => {
      let rejected = results.iter().filter(|r| !r.accepted).count();
      if rejected > 0 {
        warn!("server rejected {} of {} pushed records", rejected, results.len());
      }
      sqlx::query(
        "UPDATE box SET last_sent_to_server_at = $2, last_updated_at = now() WHERE id = $1",
      )
      .bind(this_box.id)
      .bind(send_time)
      .execute(pool)
      .await?;
    }
    Err(e) => {
      warn!("send stage failed: {:?}", e);
      return Ok(());
    }
  }

  upload_pending_files(pool, &api, this_box.id, Path::new(&config.files_dir)).await;

  match api.pull_box_updates(this_box.last_received_from_server_at).await {
    Ok(incoming) => {
      sync::apply_table_updates(pool, &incoming, sync::ApplyMode::Verbatim).await?;
      // Advance to the newest server-side timestamp actually received;
      // server rows are filtered by the server's clock, not ours.
      if let Some(newest) = sync::max_row_timestamp(&incoming) {
        sqlx::query(
          "UPDATE box SET last_received_from_server_at = $2, last_updated_at = now()
           WHERE id = $1 AND last_received_from_server_at < $2",
        )
        .bind(this_box.id)
        .bind(newest)
        .execute(pool)
        .await?;
      }
    }
    Err(e) => {
      warn!("receive stage failed: {:?}", e);
      return Ok(());
    }
  }

  download_pending_files(pool, &api, this_box.id, Path::new(&config.files_dir)).await;
  info!("sync round with server complete");
  Ok(())
}

/// Upload karya files present locally but not yet at the server. A file
/// missing on disk or a failed transfer degrades that file only.
async fn upload_pending_files(pool: &Pool<Postgres>, api: &ApiClient, box_id: i64, files_dir: &Path) {
  let pending: Vec<KaryaFileRecord> = match sqlx::query_as(
    "SELECT * FROM karya_file
     WHERE box_id = $1 AND in_box = true AND in_server = false",
  )
  .bind(box_id)
  .fetch_all(pool)
  .await
  {
    Ok(rows) => rows,
    Err(e) => {
      warn!("could not list pending uploads: {:?}", e);
      return;
    }
  };

  if pending.is_empty() {
    return;
  }
  info!("need to upload {} files to the server", pending.len());

  let mut failed = 0usize;
  for file in &pending {
    let path = match blob::blob_path(files_dir, &file.container_name, &file.name) {
      Ok(path) => path,
      Err(_) => {
        failed += 1;
        continue;
      }
    };
    let payload = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(_) => {
        warn!("karya file {} missing on disk", file.id);
        failed += 1;
        continue;
      }
    };
    let query = UploadFileQuery {
      container: file.container_name.clone(),
      name: file.name.clone(),
      checksum: file.checksum.clone(),
    };
    match api.upload_file(&query, payload).await {
      Ok(_) => {
        let _ = sqlx::query(
          "UPDATE karya_file SET in_server = true, last_updated_at = now() WHERE id = $1",
        )
        .bind(file.id)
        .execute(pool)
        .await;
      }
      Err(e) => {
        warn!("upload of karya file {} failed: {:?}", file.id, e);
        failed += 1;
      }
    }
  }

  if failed > 0 {
    warn!("failed to upload {} of {} files", failed, pending.len());
  } else {
    info!("uploaded all pending files");
  }
}

/// Download input blobs referenced by microtasks routed to this box.
async fn download_pending_files(pool: &Pool<Postgres>, api: &ApiClient, box_id: i64, files_dir: &Path) {
  let pending: Vec<KaryaFileRecord> = match sqlx::query_as(
    "SELECT f.* FROM karya_file f
     WHERE f.in_server = true AND f.in_box = false
       AND EXISTS (
         SELECT 1 FROM microtask m
         JOIN task_assignment ta ON ta.task_id = m.task_id
         WHERE m.input_file_id = f.id AND ta.box_id = $1
       )",
  )
  .bind(box_id)
  .fetch_all(pool)
  .await
  {
    Ok(rows) => rows,
    Err(e) => {
      warn!("could not list pending downloads: {:?}", e);
      return;
    }
  };

  for file in &pending {
    match api.download_file(file.id).await {
      Ok(bytes) => {
        if blob::checksum_bytes(&bytes) != file.checksum {
          warn!("karya file {} failed checksum, discarded", file.id);
          continue;
        }
        let Ok(path) = blob::blob_path(files_dir, &file.container_name, &file.name) else {
          continue;
        };
        if tokio::fs::write(&path, &bytes).await.is_ok() {
          let _ = sqlx::query(
            "UPDATE karya_file SET in_box = true, last_updated_at = now() WHERE id = $1",
          )
          .bind(file.id)
          .execute(pool)
          .await;
        }
      }
      Err(e) => warn!("download of karya file {} failed: {:?}", file.id, e),
    }
  }
}
