//! Worker-device sync pass: six phases in fixed order. Phases 1-5 are
//! required and abort the pass with a phase-tagged error; cleanup is
//! best-effort. Later phases assume the effects of earlier ones, so the
//! pass may only be cancelled between phases, leaving everything applied
//! so far durably committed.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::assignment::WorkerSummary;
use crate::blob;
use crate::http::ApiClient;
use crate::models::{KaryaFileRecord, MicrotaskAssignmentRecord, WorkerLanguageSkillRecord, WorkerRecord};
use crate::sync::{self, TableUpdates, UpdatableTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  UploadOutputs,
  PushUpdates,
  PullUpdates,
  DownloadInputs,
  FetchVerified,
  Cleanup,
}

impl SyncPhase {
  pub const ALL: [SyncPhase; 6] = [
    SyncPhase::UploadOutputs,
    SyncPhase::PushUpdates,
    SyncPhase::PullUpdates,
    SyncPhase::DownloadInputs,
    SyncPhase::FetchVerified,
    SyncPhase::Cleanup,
  ];

  /// Progress value reached when this phase completes.
  pub fn ceiling(self) -> u8 {
    match self {
      SyncPhase::UploadOutputs => 25,
      SyncPhase::PushUpdates => 40,
      SyncPhase::PullUpdates => 55,
      SyncPhase::DownloadInputs => 80,
      SyncPhase::FetchVerified => 90,
      SyncPhase::Cleanup => 100,
    }
  }

  pub fn floor(self) -> u8 {
    let idx = Self::ALL.iter().position(|p| *p == self).unwrap_or(0);
    if idx == 0 { 0 } else { Self::ALL[idx - 1].ceiling() }
  }

  /// Whether a failure in this phase aborts the pass.
  pub fn required(self) -> bool {
    !matches!(self, SyncPhase::Cleanup)
  }

  pub fn user_message(self) -> &'static str {
    match self {
      SyncPhase::UploadOutputs => "Could not upload completed work",
      SyncPhase::PushUpdates => "Could not send updates to the box",
      SyncPhase::PullUpdates => "Could not receive updates from the box",
      SyncPhase::DownloadInputs => "Could not download task files",
      SyncPhase::FetchVerified => "Could not fetch verified results",
      SyncPhase::Cleanup => "Could not clean up local files",
    }
  }
}

#[derive(Debug, Error)]
#[error("{}", .phase.user_message())]
pub struct SyncPhaseError {
  pub phase: SyncPhase,
  #[source]
  pub source: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
  pub cancelled: bool,
  pub warning: Option<String>,
  pub summary: Option<WorkerSummary>,
}

pub struct SyncContext {
  pub pool: Pool<Postgres>,
  pub api: ApiClient,
  pub worker_id: i64,
  pub files_dir: PathBuf,
  pub cancelled: Arc<AtomicBool>,
  pub progress: watch::Sender<u8>,
}

impl SyncContext {
  fn report(&self, value: u8) {
    let _ = self.progress.send(value);
  }

  fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Relaxed)
  }
}

/// Sub-progress within a phase, scaled between its floor and ceiling.
/// Monotone in `done` and never past the ceiling.
pub fn scaled_progress(phase: SyncPhase, done: usize, total: usize) -> u8 {
  let floor = phase.floor() as usize;
  let ceiling = phase.ceiling() as usize;
  if total == 0 || done >= total {
    return ceiling as u8;
  }
  (floor + (done * (ceiling - floor)) / total) as u8
}

fn tag(phase: SyncPhase, source: anyhow::Error) -> SyncPhaseError {
  SyncPhaseError { phase, source }
}

/// Run one full sync pass. Returns the first failing required phase as a
/// user-displayable error, or an outcome that may carry a non-fatal
/// warning.
pub async fn run_sync_pass(ctx: &SyncContext) -> Result<SyncOutcome, SyncPhaseError> {
  let mut outcome = SyncOutcome::default();
  ctx.report(0);

  upload_outputs(ctx, &mut outcome)
    .await
    .map_err(|e| tag(SyncPhase::UploadOutputs, e))?;
  ctx.report(SyncPhase::UploadOutputs.ceiling());
  if ctx.is_cancelled() {
    outcome.cancelled = true;
    return Ok(outcome);
  }

  push_updates(ctx).await.map_err(|e| tag(SyncPhase::PushUpdates, e))?;
  ctx.report(SyncPhase::PushUpdates.ceiling());
  if ctx.is_cancelled() {
    outcome.cancelled = true;
    return Ok(outcome);
  }

  pull_updates(ctx, &mut outcome)
    .await
    .map_err(|e| tag(SyncPhase::PullUpdates, e))?;
  ctx.report(SyncPhase::PullUpdates.ceiling());
  if ctx.is_cancelled() {
    outcome.cancelled = true;
    return Ok(outcome);
  }

  download_inputs(ctx, &mut outcome)
    .await
    .map_err(|e| tag(SyncPhase::DownloadInputs, e))?;
  ctx.report(SyncPhase::DownloadInputs.ceiling());
  if ctx.is_cancelled() {
    outcome.cancelled = true;
    return Ok(outcome);
  }

  fetch_verified(ctx).await.map_err(|e| tag(SyncPhase::FetchVerified, e))?;
  ctx.report(SyncPhase::FetchVerified.ceiling());
  if ctx.is_cancelled() {
    outcome.cancelled = true;
    return Ok(outcome);
  }

  if let Err(e) = cleanup(ctx).await {
    warn!("cleanup phase left files behind: {:?}", e);
  }
  ctx.report(SyncPhase::Cleanup.ceiling());

  Ok(outcome)
}

/// First-run bootstrap for a device whose local store is empty: pull the
/// full update set (box row, worker row, open work) before the first
/// sync pass. A no-op once the worker row exists locally.
pub async fn bootstrap_local_store(ctx: &SyncContext) -> Result<()> {
  let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM worker WHERE id = $1")
    .bind(ctx.worker_id)
    .fetch_optional(&ctx.pool)
    .await?;
  if existing.is_some() {
    return Ok(());
  }

  let epoch = chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default();
  let updates = ctx.api.pull_worker_updates(epoch).await.context("bootstrapping local store")?;
  sync::apply_table_updates(&ctx.pool, &updates, sync::ApplyMode::Verbatim).await?;
  info!("bootstrapped local store for worker {}", ctx.worker_id);
  Ok(())
}

async fn local_worker(ctx: &SyncContext) -> Result<WorkerRecord> {
  let worker: WorkerRecord = sqlx::query_as("SELECT * FROM worker WHERE id = $1")
    .bind(ctx.worker_id)
    .fetch_one(&ctx.pool)
    .await
    .context("loading local worker record")?;
  Ok(worker)
}

/// Phase 1: package and upload the output files of completed assignments
/// that have not been uploaded yet. An assignment whose files are missing
/// on disk is reset to ASSIGNED with a warning instead of failing the
/// pass; so is one whose upload fails.
async fn upload_outputs(ctx: &SyncContext, outcome: &mut SyncOutcome) -> Result<()> {
  let pending: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'COMPLETED' AND output_file_id IS NULL
       AND COALESCE(jsonb_array_length(output->'files'), 0) > 0",
  )
  .bind(ctx.worker_id)
  .fetch_all(&ctx.pool)
  .await?;

  let total = pending.len();
  for (done, assignment) in pending.into_iter().enumerate() {
    match upload_one(ctx, &assignment).await {
      Ok(file) => {
        sync::upsert_record(&ctx.pool, UpdatableTable::KaryaFile, &serde_json::to_value(&file)?)
          .await?;
        sqlx::query(
          "UPDATE microtask_assignment
           SET output_file_id = $2, last_updated_at = now()
           WHERE id = $1",
        )
        .bind(assignment.id)
        .bind(file.id)
        .execute(&ctx.pool)
        .await?;
      }
      Err(e) => {
        warn!("resetting assignment {}: {:?}", assignment.id, e);
        sqlx::query(
          "UPDATE microtask_assignment
           SET status = 'ASSIGNED', last_updated_at = now()
           WHERE id = $1",
        )
        .bind(assignment.id)
        .execute(&ctx.pool)
        .await?;
        outcome.warning =
          Some("Some results could not be uploaded and were reset; please record them again".into());
      }
    }
    ctx.report(scaled_progress(SyncPhase::UploadOutputs, done + 1, total));
  }
  Ok(())
}

async fn upload_one(
  ctx: &SyncContext,
  assignment: &MicrotaskAssignmentRecord,
) -> Result<KaryaFileRecord> {
  let files: Vec<PathBuf> = assignment
    .output_file_names()
    .iter()
    .map(|name| blob::blob_path(&ctx.files_dir, blob::ASSIGNMENT_OUTPUT, name))
    .collect::<Result<_>>()?;

  let name = blob::output_tarball_name(assignment.id);
  let tarball = blob::blob_path(&ctx.files_dir, blob::ASSIGNMENT_OUTPUT, &name)?;
  blob::create_tarball(&tarball, &files)?;
  let checksum = blob::checksum_file(&tarball)?;
  let payload = tokio::fs::read(&tarball).await?;

  ctx.api.upload_output_file(assignment.id, &name, &checksum, payload).await
}

/// Phase 2: report completed/skipped/expired work to the box, then push
/// the worker profile and skills.
async fn push_updates(ctx: &SyncContext) -> Result<()> {
  let worker = local_worker(ctx).await?;
  let send_time = Utc::now();

  let ready: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND submitted_to_box_at IS NULL
       AND (status IN ('SKIPPED', 'EXPIRED')
            OR (status = 'COMPLETED'
                AND (output_file_id IS NOT NULL
                     OR COALESCE(jsonb_array_length(output->'files'), 0) = 0)))",
  )
  .bind(ctx.worker_id)
  .fetch_all(&ctx.pool)
  .await?;

  if !ready.is_empty() {
    let accepted = ctx.api.submit_assignments(&ready).await?;
    info!("box accepted {}/{} assignment reports", accepted.len(), ready.len());
    sqlx::query(
      "UPDATE microtask_assignment
       SET status = 'SUBMITTED', submitted_to_box_at = now(), last_updated_at = now()
       WHERE id = ANY($1) AND status = 'COMPLETED'",
    )
    .bind(&accepted)
    .execute(&ctx.pool)
    .await?;
    sqlx::query(
      "UPDATE microtask_assignment
       SET submitted_to_box_at = now(), last_updated_at = now()
       WHERE id = ANY($1) AND status IN ('SKIPPED', 'EXPIRED')",
    )
    .bind(&accepted)
    .execute(&ctx.pool)
    .await?;
  }

  let skills: Vec<WorkerLanguageSkillRecord> = sqlx::query_as(
    "SELECT * FROM worker_language_skill WHERE worker_id = $1 AND last_updated_at > $2",
  )
  .bind(ctx.worker_id)
  .bind(worker.last_sent_to_box_at)
  .fetch_all(&ctx.pool)
  .await?;

  let mut updates = vec![TableUpdates {
    table: UpdatableTable::Worker,
    rows: vec![serde_json::to_value(&worker)?],
  }];
  if !skills.is_empty() {
    updates.push(TableUpdates {
      table: UpdatableTable::WorkerLanguageSkill,
      rows: skills.iter().map(|s| serde_json::to_value(s)).collect::<Result<_, _>>()?,
    });
  }
  let results = ctx.api.push_worker_updates(&updates).await?;
  for rejected in results.iter().filter(|r| !r.accepted) {
    warn!("box rejected {} row {}: {:?}", rejected.table.table_name(), rejected.id, rejected.reason);
  }

  sqlx::query("UPDATE worker SET last_sent_to_box_at = $2, last_updated_at = now() WHERE id = $1")
    .bind(ctx.worker_id)
    .bind(send_time)
    .execute(&ctx.pool)
    .await?;
  Ok(())
}

/// Phase 3: pull newly assigned work and the balance/leaderboard
/// snapshot. The watermark is the newest assignment creation time seen
/// locally, so it compares against the clock that produced the rows; it
/// advances only after the batch is applied.
async fn pull_updates(ctx: &SyncContext, outcome: &mut SyncOutcome) -> Result<()> {
  let since: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
    "SELECT MAX(created_at) FROM microtask_assignment WHERE worker_id = $1",
  )
  .bind(ctx.worker_id)
  .fetch_one(&ctx.pool)
  .await?;
  let since = since.unwrap_or_default();

  let bundle = ctx.api.get_new_assignments(since).await?;
  info!(
    "received {} assignments across {} tasks",
    bundle.assignments.len(),
    bundle.tasks.len()
  );

  let mut updates = Vec::new();
  let pairs: [(UpdatableTable, Vec<serde_json::Value>); 4] = [
    (UpdatableTable::Task, values_of(&bundle.tasks)?),
    (UpdatableTable::MicrotaskGroup, values_of(&bundle.groups)?),
    (UpdatableTable::Microtask, values_of(&bundle.microtasks)?),
    (UpdatableTable::MicrotaskAssignment, values_of(&bundle.assignments)?),
  ];
  for (table, rows) in pairs {
    if !rows.is_empty() {
      updates.push(TableUpdates { table, rows });
    }
  }
  sync::apply_table_updates(&ctx.pool, &updates, sync::ApplyMode::Verbatim).await?;

  outcome.summary = Some(ctx.api.get_summary().await?);

  let received: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
    "SELECT MAX(created_at) FROM microtask_assignment WHERE worker_id = $1",
  )
  .bind(ctx.worker_id)
  .fetch_one(&ctx.pool)
  .await?;
  if let Some(received) = received {
    sqlx::query(
      "UPDATE worker SET last_received_from_box_at = $2, last_updated_at = now() WHERE id = $1",
    )
    .bind(ctx.worker_id)
    .bind(received)
    .execute(&ctx.pool)
    .await?;
  }
  Ok(())
}

/// Phase 4: fetch input tarballs not yet cached for assigned work. A
/// single failed download degrades that assignment only.
async fn download_inputs(ctx: &SyncContext, outcome: &mut SyncOutcome) -> Result<()> {
  let wanted: Vec<(i64, String)> = sqlx::query_as(
    "SELECT DISTINCT m.id, f.checksum
     FROM microtask_assignment a
     JOIN microtask m ON m.id = a.microtask_id
     JOIN karya_file f ON f.id = m.input_file_id
     WHERE a.worker_id = $1 AND a.status = 'ASSIGNED'",
  )
  .bind(ctx.worker_id)
  .fetch_all(&ctx.pool)
  .await?;

  let missing: Vec<(i64, String)> = wanted
    .into_iter()
    .filter(|(microtask_id, _)| {
      blob::blob_path(&ctx.files_dir, blob::MICROTASK_INPUT, &blob::input_tarball_name(*microtask_id))
        .map(|p| !p.exists())
        .unwrap_or(true)
    })
    .collect();

  let total = missing.len();
  for (done, (microtask_id, checksum)) in missing.into_iter().enumerate() {
    match ctx.api.download_input_file(microtask_id).await {
      Ok(bytes) => {
        if blob::checksum_bytes(&bytes) != checksum {
          warn!("input file for microtask {} failed checksum, discarded", microtask_id);
          outcome.warning = Some("Some task files could not be downloaded".into());
        } else {
          let path = blob::blob_path(
            &ctx.files_dir,
            blob::MICROTASK_INPUT,
            &blob::input_tarball_name(microtask_id),
          )?;
          tokio::fs::write(&path, &bytes).await?;
        }
      }
      Err(e) => {
        warn!("could not download input for microtask {}: {:?}", microtask_id, e);
        outcome.warning = Some("Some task files could not be downloaded".into());
      }
    }
    ctx.report(scaled_progress(SyncPhase::DownloadInputs, done + 1, total));
  }
  Ok(())
}

/// Phase 5: pull assignments verified since the last fetch, for the
/// feedback and history screens. The watermark is the newest verified_at
/// already held locally; verification timestamps all come from the
/// server's clock.
async fn fetch_verified(ctx: &SyncContext) -> Result<()> {
  let since: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
    "SELECT MAX(verified_at) FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'VERIFIED'",
  )
  .bind(ctx.worker_id)
  .fetch_one(&ctx.pool)
  .await?;
  let since = since.unwrap_or_default();

  let verified = ctx.api.get_verified_assignments(since).await?;
  if !verified.is_empty() {
    info!("received {} verification results", verified.len());
    let updates = vec![TableUpdates {
      table: UpdatableTable::MicrotaskAssignment,
      rows: values_of(&verified)?,
    }];
    sync::apply_table_updates(&ctx.pool, &updates, sync::ApplyMode::Verbatim).await?;

    if let Some(newest) = sync::max_row_timestamp(&updates) {
      sqlx::query(
        "UPDATE worker SET last_received_from_server_at = $2, last_updated_at = now() WHERE id = $1",
      )
      .bind(ctx.worker_id)
      .bind(newest)
      .execute(&ctx.pool)
      .await?;
    }
  }
  Ok(())
}

/// Phase 6: drop local artifacts that are safely upstream. Never fails
/// the pass.
async fn cleanup(ctx: &SyncContext) -> Result<()> {
  let uploaded: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND output_file_id IS NOT NULL
       AND status IN ('SUBMITTED', 'VERIFIED')",
  )
  .bind(ctx.worker_id)
  .fetch_all(&ctx.pool)
  .await?;

  for assignment in &uploaded {
    let tarball = blob::blob_path(
      &ctx.files_dir,
      blob::ASSIGNMENT_OUTPUT,
      &blob::output_tarball_name(assignment.id),
    )?;
    let _ = std::fs::remove_file(tarball);
    for name in assignment.output_file_names() {
      if let Ok(path) = blob::blob_path(&ctx.files_dir, blob::ASSIGNMENT_OUTPUT, &name) {
        let _ = std::fs::remove_file(path);
      }
    }
  }

  let submitted_inputs: Vec<i64> = sqlx::query_scalar(
    "SELECT DISTINCT m.id
     FROM microtask m
     JOIN microtask_assignment a ON a.microtask_id = m.id
     WHERE a.worker_id = $1 AND m.input_file_id IS NOT NULL
       AND a.status IN ('SUBMITTED', 'VERIFIED')",
  )
  .bind(ctx.worker_id)
  .fetch_all(&ctx.pool)
  .await?;

  for microtask_id in submitted_inputs {
    if let Ok(path) = blob::blob_path(
      &ctx.files_dir,
      blob::MICROTASK_INPUT,
      &blob::input_tarball_name(microtask_id),
    ) {
      let _ = std::fs::remove_file(path);
    }
  }
  Ok(())
}

fn values_of<T: serde::Serialize>(records: &[T]) -> Result<Vec<serde_json::Value>> {
  records
    .iter()
    .map(|r| serde_json::to_value(r).context("serializing record"))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn phases_run_in_fixed_order() {
    assert_eq!(
      SyncPhase::ALL,
      [
        SyncPhase::UploadOutputs,
        SyncPhase::PushUpdates,
        SyncPhase::PullUpdates,
        SyncPhase::DownloadInputs,
        SyncPhase::FetchVerified,
        SyncPhase::Cleanup,
      ]
    );
  }

  #[test]
  fn progress_ceilings_increase_to_one_hundred() {
    let ceilings: Vec<u8> = SyncPhase::ALL.iter().map(|p| p.ceiling()).collect();
    for pair in ceilings.windows(2) {
      assert!(pair[0] < pair[1]);
    }
    assert_eq!(*ceilings.last().unwrap(), 100);
  }

  #[test]
  fn each_floor_is_the_previous_ceiling() {
    assert_eq!(SyncPhase::UploadOutputs.floor(), 0);
    for pair in SyncPhase::ALL.windows(2) {
      assert_eq!(pair[1].floor(), pair[0].ceiling());
    }
  }

  #[test]
  fn only_cleanup_is_optional() {
    for phase in SyncPhase::ALL {
      assert_eq!(phase.required(), phase != SyncPhase::Cleanup);
    }
  }

  #[test]
  fn scaled_progress_is_monotone_and_bounded() {
    let phase = SyncPhase::DownloadInputs;
    let mut last = phase.floor();
    for done in 0..=10 {
      let value = scaled_progress(phase, done, 10);
      assert!(value >= last);
      assert!(value <= phase.ceiling());
      last = value;
    }
    assert_eq!(scaled_progress(phase, 10, 10), phase.ceiling());
    assert_eq!(scaled_progress(phase, 0, 0), phase.ceiling());
  }

  #[test]
  fn phase_errors_surface_the_fixed_user_message() {
    let err = SyncPhaseError {
      phase: SyncPhase::PushUpdates,
      source: anyhow::anyhow!("connection refused"),
    };
    assert_eq!(err.to_string(), "Could not send updates to the box");
  }

  #[test]
  fn user_messages_are_distinct() {
    let mut messages: Vec<&str> = SyncPhase::ALL.iter().map(|p| p.user_message()).collect();
    messages.sort();
    messages.dedup();
    assert_eq!(messages.len(), SyncPhase::ALL.len());
  }
}
