//! Timestamp-filtered push/pull of the updatable tables between adjacent
//! tiers. Batches are applied row by row: a stale row is skipped and
//! reported, never fatal; ownership and table-scope violations abort the
//! whole request.

use anyhow::{Result, anyhow};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use sqlx::{Pool, Postgres};
use sqlx::types::Json;
use tracing::error;

use crate::id;
use crate::ledger;
use crate::models::{
  BoxRecord, KaryaFileRecord, MicrotaskAssignmentRecord, MicrotaskGroupRecord, MicrotaskRecord,
  TaskAssignmentRecord, TaskRecord, WorkerLanguageSkillRecord, WorkerRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatableTable {
  Box,
  Worker,
  WorkerLanguageSkill,
  KaryaFile,
  Task,
  MicrotaskGroup,
  Microtask,
  TaskAssignment,
  MicrotaskAssignment,
}

/// Tables a worker device may push to its box.
pub const WORKER_UPDATABLE: &[UpdatableTable] = &[
  UpdatableTable::Worker,
  UpdatableTable::WorkerLanguageSkill,
  UpdatableTable::MicrotaskAssignment,
];

/// Tables a box may push to the server.
pub const BOX_UPDATABLE: &[UpdatableTable] = &[
  UpdatableTable::Box,
  UpdatableTable::Worker,
  UpdatableTable::WorkerLanguageSkill,
  UpdatableTable::MicrotaskAssignment,
  UpdatableTable::KaryaFile,
];

/// Referential order for applying batches: parents land before children.
const APPLY_ORDER: &[UpdatableTable] = &[
  UpdatableTable::Box,
  UpdatableTable::Worker,
  UpdatableTable::WorkerLanguageSkill,
  UpdatableTable::KaryaFile,
  UpdatableTable::Task,
  UpdatableTable::MicrotaskGroup,
  UpdatableTable::Microtask,
  UpdatableTable::TaskAssignment,
  UpdatableTable::MicrotaskAssignment,
];

impl UpdatableTable {
  pub fn table_name(self) -> &'static str {
    match self {
      UpdatableTable::Box => "box",
      UpdatableTable::Worker => "worker",
      UpdatableTable::WorkerLanguageSkill => "worker_language_skill",
      UpdatableTable::KaryaFile => "karya_file",
      UpdatableTable::Task => "task",
      UpdatableTable::MicrotaskGroup => "microtask_group",
      UpdatableTable::Microtask => "microtask",
      UpdatableTable::TaskAssignment => "task_assignment",
      UpdatableTable::MicrotaskAssignment => "microtask_assignment",
    }
  }

  /// Columns replaced on conflict. `id` stays put; `created_at` travels
  /// with the row so replicas agree on creation time.
  pub fn columns(self) -> &'static [&'static str] {
    match self {
      UpdatableTable::Box => &[
        "creation_code", "name", "url", "key", "last_sent_to_server_at",
        "last_received_from_server_at", "params", "created_at", "last_updated_at",
      ],
      UpdatableTable::Worker => &[
        "local_id", "box_id", "access_code", "id_token", "phone_number", "full_name",
        "year_of_birth", "gender", "app_language", "last_sent_to_box_at",
        "last_received_from_box_at", "last_sent_to_server_at",
        "last_received_from_server_at", "params", "created_at", "last_updated_at",
      ],
      UpdatableTable::WorkerLanguageSkill => &[
        "local_id", "box_id", "worker_id", "language", "can_speak", "can_read",
        "can_type", "proficiency", "created_at", "last_updated_at",
      ],
      UpdatableTable::KaryaFile => &[
        "local_id", "box_id", "worker_id", "container_name", "name", "url", "creator",
        "algorithm", "checksum", "in_box", "in_server", "params", "created_at",
        "last_updated_at",
      ],
      UpdatableTable::Task => &[
        "scenario_name", "language", "name", "description", "params", "input_file_id",
        "output_file_id", "budget", "deadline", "assignment_granularity",
        "group_assignment_order", "microtask_assignment_order", "status", "created_at",
        "last_updated_at",
      ],
      UpdatableTable::MicrotaskGroup => &[
        "task_id", "microtask_assignment_order", "status", "params", "created_at",
        "last_updated_at",
      ],
      UpdatableTable::Microtask => &[
        "task_id", "group_id", "input", "input_file_id", "deadline", "credits",
        "status", "params", "created_at", "last_updated_at",
      ],
      UpdatableTable::TaskAssignment => &[
        "task_id", "box_id", "policy", "params", "status", "created_at",
        "last_updated_at",
      ],
      UpdatableTable::MicrotaskAssignment => &[
        "local_id", "box_id", "microtask_id", "worker_id", "deadline", "status",
        "output", "output_file_id", "credits", "completed_at", "submitted_to_box_at",
        "verified_at", "params", "created_at", "last_updated_at",
      ],
    }
  }

  fn apply_rank(self) -> usize {
    APPLY_ORDER.iter().position(|t| *t == self).unwrap_or(APPLY_ORDER.len())
  }
}

/// One table's worth of new-or-changed rows, as sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableUpdates {
  pub table: UpdatableTable,
  pub rows: Vec<Value>,
}

/// How to treat row timestamps when applying a batch.
///
/// Rows flowing upward (worker -> box -> server) are re-stamped with the
/// receiving tier's clock after the monotonicity check, so the next
/// outbound filter sees them as fresh local changes. Rows flowing
/// downward are applied verbatim; leaves forward nothing further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
  Verbatim,
  Restamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResult {
  pub table: UpdatableTable,
  pub id: i64,
  pub accepted: bool,
  pub reason: Option<String>,
}

/// Whole-row upsert through `jsonb_populate_record`. The update arm runs
/// under the `check_last_updated` trigger, so a stale row surfaces as a
/// per-statement error the caller folds into its report. The composite
/// type is schema-qualified: a bare `box` would resolve to the built-in
/// geometric type.
fn upsert_sql(table: UpdatableTable) -> String {
  let set = table
    .columns()
    .iter()
    .map(|c| format!("{c} = excluded.{c}"))
    .collect::<Vec<_>>()
    .join(", ");
  format!(
    "INSERT INTO {t} SELECT * FROM jsonb_populate_record(NULL::public.{t}, $1) \
     ON CONFLICT (id) DO UPDATE SET {set}",
    t = table.table_name()
  )
}

fn row_id(row: &Value) -> Result<i64> {
  row
    .get("id")
    .and_then(Value::as_i64)
    .ok_or_else(|| anyhow!("malformed row: missing integer id"))
}

/// Upsert a single replicated row.
pub async fn upsert_record(
  pool: &Pool<Postgres>,
  table: UpdatableTable,
  row: &Value,
) -> sqlx::Result<()> {
  sqlx::query(&upsert_sql(table)).bind(Json(row)).execute(pool).await?;
  Ok(())
}

/// Apply batches in referential order. Returns one result per row; only a
/// malformed payload aborts the whole call.
pub async fn apply_table_updates(
  pool: &Pool<Postgres>,
  updates: &[TableUpdates],
  mode: ApplyMode,
) -> Result<Vec<RecordResult>> {
  let mut ordered: Vec<&TableUpdates> = updates.iter().collect();
  ordered.sort_by_key(|u| u.table.apply_rank());

  let mut results = Vec::new();
  for batch in ordered {
    for row in &batch.rows {
      let id = row_id(row)?;
      match upsert_record(pool, batch.table, row).await {
        Ok(_) => {
          if mode == ApplyMode::Restamp {
            let bump = format!(
              "UPDATE {} SET last_updated_at = now() WHERE id = $1 AND last_updated_at < now()",
              batch.table.table_name()
            );
            if let Err(e) = sqlx::query(&bump).bind(id).execute(pool).await {
              error!("could not restamp {} row {}: {:?}", batch.table.table_name(), id, e);
            }
          }
          results.push(RecordResult {
            table: batch.table,
            id,
            accepted: true,
            reason: None,
          });
        }
        Err(e) if ledger::is_trigger_rejection(&e) => {
          results.push(RecordResult {
            table: batch.table,
            id,
            accepted: false,
            reason: Some("update from the past".into()),
          });
        }
        Err(e) => {
          error!("failed to apply {} row {}: {:?}", batch.table.table_name(), id, e);
          results.push(RecordResult {
            table: batch.table,
            id,
            accepted: false,
            reason: Some("could not apply record".into()),
          });
        }
      }
    }
  }
  Ok(results)
}

/// A pushed row's global id must be the one its claimed (box, local
/// sequence) pair computes to; anything else is a forgery or corruption.
fn validate_row_identity(row: &Value) -> Result<()> {
  let (Some(row_id), Some(local_id)) = (
    row.get("id").and_then(Value::as_i64),
    row.get("local_id").and_then(Value::as_i64),
  ) else {
    return Ok(());
  };
  let box_id = row.get("box_id").and_then(Value::as_i64);
  let expected = id::compute_global_id(box_id, local_id)?;
  if expected != row_id {
    return Err(anyhow!("row id {} does not match its box and local sequence", row_id));
  }
  Ok(())
}

/// Reject a worker push that strays outside its own records or outside
/// the worker-updatable tables. Violations abort the whole request.
pub fn validate_worker_updates(worker_id: i64, updates: &[TableUpdates]) -> Result<()> {
  for batch in updates {
    if !WORKER_UPDATABLE.contains(&batch.table) {
      return Err(anyhow!("worker cannot update table '{}'", batch.table.table_name()));
    }
    for row in &batch.rows {
      let owner = match batch.table {
        UpdatableTable::Worker => row.get("id").and_then(Value::as_i64),
        _ => row.get("worker_id").and_then(Value::as_i64),
      };
      if owner != Some(worker_id) {
        return Err(anyhow!("worker {} cannot update records of another worker", worker_id));
      }
      validate_row_identity(row)?;
    }
  }
  Ok(())
}

/// Same gate for a box pushing to the server.
pub fn validate_box_updates(box_id: i64, updates: &[TableUpdates]) -> Result<()> {
  for batch in updates {
    if !BOX_UPDATABLE.contains(&batch.table) {
      return Err(anyhow!("box cannot update table '{}'", batch.table.table_name()));
    }
    for row in &batch.rows {
      let owner = match batch.table {
        UpdatableTable::Box => row.get("id").and_then(Value::as_i64),
        _ => row.get("box_id").and_then(Value::as_i64),
      };
      if owner != Some(box_id) {
        return Err(anyhow!("box {} cannot update records of another box", box_id));
      }
      validate_row_identity(row)?;
    }
  }
  Ok(())
}

/// Newest `last_updated_at` carried by a batch set. Receivers advance
/// their watermarks to this value, so watermark and row clocks always
/// come from the same tier.
pub fn max_row_timestamp(updates: &[TableUpdates]) -> Option<chrono::DateTime<chrono::Utc>> {
  updates
    .iter()
    .flat_map(|batch| &batch.rows)
    .filter_map(|row| row.get("last_updated_at").and_then(Value::as_str))
    .filter_map(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
    .map(|ts| ts.with_timezone(&chrono::Utc))
    .max()
}

fn to_rows<T: Serialize>(records: &[T]) -> Vec<Value> {
  records.iter().map(|r| serde_json::to_value(r).unwrap_or(Value::Null)).collect()
}

fn push_batch(updates: &mut Vec<TableUpdates>, table: UpdatableTable, rows: Vec<Value>) {
  if !rows.is_empty() {
    updates.push(TableUpdates { table, rows });
  }
}

/// Box-side collection of everything a worker device should receive:
/// newly assigned work with its task context, verification results with
/// outputs blanked, input-file metadata, and an echo of the worker row
/// carrying the current watermarks.
pub async fn collect_updates_for_worker(
  pool: &Pool<Postgres>,
  worker: &WorkerRecord,
) -> Result<Vec<TableUpdates>> {
  let mut updates = Vec::new();

  let assigned: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'ASSIGNED' AND last_updated_at > $2
     ORDER BY last_updated_at",
  )
  .bind(worker.id)
  .bind(worker.last_received_from_box_at)
  .fetch_all(pool)
  .await?;

  // A device syncing from scratch (reinstall) gets its full verified
  // history back, not just the verdicts since its last fetch.
  let eon = chrono::DateTime::<chrono::Utc>::default();
  let from_server = if worker.last_received_from_box_at == eon {
    eon
  } else {
    worker.last_received_from_server_at
  };

  let verified: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'VERIFIED' AND last_updated_at > $2
     ORDER BY last_updated_at",
  )
  .bind(worker.id)
  .bind(from_server)
  .fetch_all(pool)
  .await?;

  // The device only needs the verdict, not its own payload back.
  let verified: Vec<MicrotaskAssignmentRecord> = verified
    .into_iter()
    .map(|mut a| {
      a.output = serde_json::json!({});
      a.output_file_id = None;
      a
    })
    .collect();

  let microtask_ids: Vec<i64> = assigned.iter().map(|a| a.microtask_id).collect();
  let microtasks: Vec<MicrotaskRecord> =
    sqlx::query_as("SELECT * FROM microtask WHERE id = ANY($1)")
      .bind(&microtask_ids)
      .fetch_all(pool)
      .await?;

  let group_ids: Vec<i64> = microtasks.iter().filter_map(|m| m.group_id).collect();
  let groups: Vec<MicrotaskGroupRecord> =
    sqlx::query_as("SELECT * FROM microtask_group WHERE id = ANY($1)")
      .bind(&group_ids)
      .fetch_all(pool)
      .await?;

  let task_ids: Vec<i64> = microtasks.iter().map(|m| m.task_id).collect();
  let tasks: Vec<TaskRecord> = sqlx::query_as("SELECT * FROM task WHERE id = ANY($1)")
    .bind(&task_ids)
    .fetch_all(pool)
    .await?;

  let input_file_ids: Vec<i64> = microtasks.iter().filter_map(|m| m.input_file_id).collect();
  let mut files: Vec<KaryaFileRecord> =
    sqlx::query_as("SELECT * FROM karya_file WHERE id = ANY($1)")
      .bind(&input_file_ids)
      .fetch_all(pool)
      .await?;

  // Let the device learn which of its uploads are safely in the box, so
  // cleanup can reclaim the local artifacts.
  let uploaded: Vec<KaryaFileRecord> = sqlx::query_as(
    "SELECT * FROM karya_file
     WHERE worker_id = $1 AND in_box = true AND last_updated_at > $2",
  )
  .bind(worker.id)
  .bind(worker.last_received_from_box_at)
  .fetch_all(pool)
  .await?;
  files.extend(uploaded);

  // The device's store carries the same schema; it needs its box row
  // once for referential integrity, with the session secret blanked.
  let this_box: Option<BoxRecord> = sqlx::query_as("SELECT * FROM box WHERE id = $1")
    .bind(worker.box_id)
    .fetch_optional(pool)
    .await?;
  let boxes: Vec<BoxRecord> = this_box
    .into_iter()
    .map(|mut b| {
      b.key = None;
      b
    })
    .collect();

  push_batch(&mut updates, UpdatableTable::Box, to_rows(&boxes));
  push_batch(&mut updates, UpdatableTable::Worker, to_rows(&[worker.clone()]));
  push_batch(&mut updates, UpdatableTable::KaryaFile, to_rows(&files));
  push_batch(&mut updates, UpdatableTable::Task, to_rows(&tasks));
  push_batch(&mut updates, UpdatableTable::MicrotaskGroup, to_rows(&groups));
  push_batch(&mut updates, UpdatableTable::Microtask, to_rows(&microtasks));
  let mut assignments = assigned;
  assignments.extend(verified);
  push_batch(&mut updates, UpdatableTable::MicrotaskAssignment, to_rows(&assignments));

  Ok(updates)
}

/// Box-side collection for the box -> server leg: everything this box
/// owns that changed since it last reported.
pub async fn collect_updates_for_server(
  pool: &Pool<Postgres>,
  this_box: &BoxRecord,
) -> Result<Vec<TableUpdates>> {
  let since = this_box.last_sent_to_server_at;
  let mut updates = Vec::new();

  push_batch(&mut updates, UpdatableTable::Box, to_rows(&[this_box.clone()]));

  let workers: Vec<WorkerRecord> =
    sqlx::query_as("SELECT * FROM worker WHERE box_id = $1 AND last_updated_at > $2")
      .bind(this_box.id)
      .bind(since)
      .fetch_all(pool)
      .await?;
  push_batch(&mut updates, UpdatableTable::Worker, to_rows(&workers));

  let skills: Vec<WorkerLanguageSkillRecord> = sqlx::query_as(
    "SELECT * FROM worker_language_skill WHERE box_id = $1 AND last_updated_at > $2",
  )
  .bind(this_box.id)
  .bind(since)
  .fetch_all(pool)
  .await?;
  push_batch(&mut updates, UpdatableTable::WorkerLanguageSkill, to_rows(&skills));

  let files: Vec<KaryaFileRecord> = sqlx::query_as(
    "SELECT * FROM karya_file WHERE box_id = $1 AND last_updated_at > $2",
  )
  .bind(this_box.id)
  .bind(since)
  .fetch_all(pool)
  .await?;
  push_batch(&mut updates, UpdatableTable::KaryaFile, to_rows(&files));

  let assignments: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment WHERE box_id = $1 AND last_updated_at > $2",
  )
  .bind(this_box.id)
  .bind(since)
  .fetch_all(pool)
  .await?;
  push_batch(&mut updates, UpdatableTable::MicrotaskAssignment, to_rows(&assignments));

  Ok(updates)
}

/// Server-side collection for the server -> box leg: task material routed
/// to this box plus verification verdicts for its workers.
pub async fn collect_updates_for_box(
  pool: &Pool<Postgres>,
  box_id: i64,
  since: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<TableUpdates>> {
  let mut updates = Vec::new();

  let task_assignments: Vec<TaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM task_assignment WHERE box_id = $1 AND status <> 'COMPLETED'",
  )
  .bind(box_id)
  .fetch_all(pool)
  .await?;
  let task_ids: Vec<i64> = task_assignments.iter().map(|ta| ta.task_id).collect();

  let tasks: Vec<TaskRecord> = sqlx::query_as(
    "SELECT * FROM task WHERE id = ANY($1) AND last_updated_at > $2",
  )
  .bind(&task_ids)
  .bind(since)
  .fetch_all(pool)
  .await?;

  let groups: Vec<MicrotaskGroupRecord> = sqlx::query_as(
    "SELECT * FROM microtask_group WHERE task_id = ANY($1) AND last_updated_at > $2",
  )
  .bind(&task_ids)
  .bind(since)
  .fetch_all(pool)
  .await?;

  let microtasks: Vec<MicrotaskRecord> = sqlx::query_as(
    "SELECT * FROM microtask WHERE task_id = ANY($1) AND last_updated_at > $2",
  )
  .bind(&task_ids)
  .bind(since)
  .fetch_all(pool)
  .await?;

  let input_file_ids: Vec<i64> = microtasks.iter().filter_map(|m| m.input_file_id).collect();
  let files: Vec<KaryaFileRecord> = sqlx::query_as(
    "SELECT * FROM karya_file
     WHERE id = ANY($1)
        OR (box_id = $2 AND in_server = true AND last_updated_at > $3)",
  )
  .bind(&input_file_ids)
  .bind(box_id)
  .bind(since)
  .fetch_all(pool)
  .await?;

  let verdicts: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE box_id = $1 AND status = 'VERIFIED' AND last_updated_at > $2",
  )
  .bind(box_id)
  .bind(since)
  .fetch_all(pool)
  .await?;

  push_batch(&mut updates, UpdatableTable::KaryaFile, to_rows(&files));
  push_batch(&mut updates, UpdatableTable::Task, to_rows(&tasks));
  push_batch(&mut updates, UpdatableTable::MicrotaskGroup, to_rows(&groups));
  push_batch(&mut updates, UpdatableTable::Microtask, to_rows(&microtasks));
  push_batch(&mut updates, UpdatableTable::TaskAssignment, to_rows(&task_assignments));
  push_batch(&mut updates, UpdatableTable::MicrotaskAssignment, to_rows(&verdicts));

  Ok(updates)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn table_names_match_the_wire_format() {
    for (table, name) in [
      (UpdatableTable::Worker, "worker"),
      (UpdatableTable::WorkerLanguageSkill, "worker_language_skill"),
      (UpdatableTable::MicrotaskAssignment, "microtask_assignment"),
      (UpdatableTable::KaryaFile, "karya_file"),
    ] {
      assert_eq!(table.table_name(), name);
      assert_eq!(serde_json::to_value(table).unwrap(), json!(name));
    }
  }

  #[test]
  fn upsert_replaces_every_column_except_id() {
    let sql = upsert_sql(UpdatableTable::MicrotaskAssignment);
    assert!(sql.starts_with("INSERT INTO microtask_assignment"));
    assert!(sql.contains("jsonb_populate_record(NULL::public.microtask_assignment, $1)"));
    assert!(sql.contains("status = excluded.status"));
    assert!(sql.contains("last_updated_at = excluded.last_updated_at"));
    assert!(!sql.contains("id = excluded.id"));
  }

  #[test]
  fn worker_push_is_limited_to_worker_updatable_tables() {
    let updates = vec![TableUpdates {
      table: UpdatableTable::Task,
      rows: vec![json!({"id": 1, "worker_id": 9})],
    }];
    assert!(validate_worker_updates(9, &updates).is_err());
  }

  #[test]
  fn worker_push_must_own_every_row() {
    let mine = vec![TableUpdates {
      table: UpdatableTable::MicrotaskAssignment,
      rows: vec![json!({"id": 1, "worker_id": 9}), json!({"id": 2, "worker_id": 9})],
    }];
    assert!(validate_worker_updates(9, &mine).is_ok());

    let theirs = vec![TableUpdates {
      table: UpdatableTable::MicrotaskAssignment,
      rows: vec![json!({"id": 1, "worker_id": 9}), json!({"id": 2, "worker_id": 8})],
    }];
    assert!(validate_worker_updates(9, &theirs).is_err());
  }

  #[test]
  fn worker_row_push_is_limited_to_self() {
    let own = vec![TableUpdates {
      table: UpdatableTable::Worker,
      rows: vec![json!({"id": 9})],
    }];
    assert!(validate_worker_updates(9, &own).is_ok());

    let other = vec![TableUpdates {
      table: UpdatableTable::Worker,
      rows: vec![json!({"id": 8})],
    }];
    assert!(validate_worker_updates(9, &other).is_err());
  }

  #[test]
  fn box_push_checks_scope_and_ownership() {
    let ok = vec![TableUpdates {
      table: UpdatableTable::KaryaFile,
      rows: vec![json!({"id": 5, "box_id": 3})],
    }];
    assert!(validate_box_updates(3, &ok).is_ok());

    let wrong_box = vec![TableUpdates {
      table: UpdatableTable::KaryaFile,
      rows: vec![json!({"id": 5, "box_id": 4})],
    }];
    assert!(validate_box_updates(3, &wrong_box).is_err());

    let out_of_scope = vec![TableUpdates {
      table: UpdatableTable::Task,
      rows: vec![json!({"id": 5, "box_id": 3})],
    }];
    assert!(validate_box_updates(3, &out_of_scope).is_err());
  }

  #[test]
  fn forged_row_identities_are_rejected() {
    let consistent = vec![TableUpdates {
      table: UpdatableTable::MicrotaskAssignment,
      rows: vec![json!({
        "id": (3i64 << 48) + 42, "local_id": 42, "box_id": 3, "worker_id": 9
      })],
    }];
    assert!(validate_worker_updates(9, &consistent).is_ok());

    let forged = vec![TableUpdates {
      table: UpdatableTable::MicrotaskAssignment,
      rows: vec![json!({
        "id": (7i64 << 48) + 42, "local_id": 42, "box_id": 3, "worker_id": 9
      })],
    }];
    assert!(validate_worker_updates(9, &forged).is_err());
  }

  #[test]
  fn rows_without_an_id_are_malformed() {
    assert!(row_id(&json!({"worker_id": 2})).is_err());
    assert_eq!(row_id(&json!({"id": 7})).unwrap(), 7);
  }

  #[test]
  fn max_row_timestamp_spans_all_batches() {
    let updates = vec![
      TableUpdates {
        table: UpdatableTable::Worker,
        rows: vec![json!({"id": 1, "last_updated_at": "2024-03-01T10:00:00Z"})],
      },
      TableUpdates {
        table: UpdatableTable::MicrotaskAssignment,
        rows: vec![
          json!({"id": 2, "last_updated_at": "2024-03-02T08:30:00Z"}),
          json!({"id": 3, "last_updated_at": "2024-01-15T00:00:00Z"}),
        ],
      },
    ];
    let max = max_row_timestamp(&updates).unwrap();
    assert_eq!(max.to_rfc3339(), "2024-03-02T08:30:00+00:00");
    assert!(max_row_timestamp(&[]).is_none());
  }

  #[test]
  fn parents_apply_before_children() {
    let mut tables = vec![
      UpdatableTable::MicrotaskAssignment,
      UpdatableTable::Worker,
      UpdatableTable::Microtask,
      UpdatableTable::Task,
    ];
    tables.sort_by_key(|t| t.apply_rank());
    assert_eq!(
      tables,
      vec![
        UpdatableTable::Worker,
        UpdatableTable::Task,
        UpdatableTable::Microtask,
        UpdatableTable::MicrotaskAssignment,
      ]
    );
  }
}
