//! Assignment engine. Keeps a per-worker pool of PREASSIGNED work that a
//! sync request promotes wholesale to ASSIGNED, and replenishes the pool
//! off the request path through the background queue.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Serialize, Deserialize};
use sqlx::{Pool, Postgres};
use tracing::{info, warn};

use crate::ledger;
use crate::models::{
  AssignmentGranularity, AssignmentOrder, MicrotaskAssignmentRecord, MicrotaskAssignmentStatus,
  MicrotaskGroupRecord, MicrotaskRecord, TaskRecord, TaskStatus, WorkerLanguageSkillRecord,
  WorkerRecord,
};

/// Everything a worker needs to render newly assigned work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentBundle {
  pub tasks: Vec<TaskRecord>,
  pub groups: Vec<MicrotaskGroupRecord>,
  pub microtasks: Vec<MicrotaskRecord>,
  pub assignments: Vec<MicrotaskAssignmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
  pub worker_id: i64,
  pub full_name: Option<String>,
  pub credits: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
  pub balance: f32,
  pub leaderboard: Vec<LeaderboardEntry>,
}

/// Snapshot rule: a worker with open ASSIGNED work gets exactly that set
/// back; only an empty plate promotes the PREASSIGNED pool. A mid-session
/// top-up would hand the device an inconsistent view of its open work.
pub async fn get_new_assignments(
  pool: &Pool<Postgres>,
  worker: &WorkerRecord,
  since: DateTime<Utc>,
) -> Result<AssignmentBundle> {
  let open: i64 = sqlx::query_scalar(
    "SELECT COUNT(*) FROM microtask_assignment WHERE worker_id = $1 AND status = 'ASSIGNED'",
  )
  .bind(worker.id)
  .fetch_one(pool)
  .await?;

  if open == 0 {
    let promoted = sqlx::query(
      "UPDATE microtask_assignment
       SET status = 'ASSIGNED', last_updated_at = now()
       WHERE worker_id = $1 AND status = 'PREASSIGNED'",
    )
    .bind(worker.id)
    .execute(pool)
    .await?
    .rows_affected();
    if promoted > 0 {
      info!("promoted {} preassignments for worker {}", promoted, worker.id);
    }
  }

  let assignments: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'ASSIGNED' AND created_at > $2
     ORDER BY id",
  )
  .bind(worker.id)
  .bind(since)
  .fetch_all(pool)
  .await?;

  bundle_for(pool, assignments).await
}

pub async fn get_verified_assignments(
  pool: &Pool<Postgres>,
  worker: &WorkerRecord,
  since: DateTime<Utc>,
) -> Result<Vec<MicrotaskAssignmentRecord>> {
  let rows: Vec<MicrotaskAssignmentRecord> = sqlx::query_as(
    "SELECT * FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'VERIFIED' AND verified_at > $2
     ORDER BY verified_at",
  )
  .bind(worker.id)
  .bind(since)
  .fetch_all(pool)
  .await?;
  Ok(rows)
}

async fn bundle_for(
  pool: &Pool<Postgres>,
  assignments: Vec<MicrotaskAssignmentRecord>,
) -> Result<AssignmentBundle> {
  let microtask_ids: Vec<i64> = assignments.iter().map(|a| a.microtask_id).collect();
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

  Ok(AssignmentBundle { tasks, groups, microtasks, assignments })
}

/// Statuses a worker may report through the submit endpoint.
fn submittable(status: MicrotaskAssignmentStatus) -> bool {
  use MicrotaskAssignmentStatus::*;
  matches!(status, Completed | Skipped | Expired)
}

/// Apply a worker's completed/skipped/expired reports. Rejections are per
/// record: a row that is not the caller's, carries a status this endpoint
/// does not accept, is stale, or makes an illegal transition is dropped
/// (and logged) while the rest of the batch proceeds.
pub async fn submit_assignments(
  pool: &Pool<Postgres>,
  worker_id: i64,
  reports: &[MicrotaskAssignmentRecord],
) -> Result<Vec<i64>> {
  let mut accepted = Vec::new();

  for report in reports {
    let stored: Option<MicrotaskAssignmentRecord> =
      sqlx::query_as("SELECT * FROM microtask_assignment WHERE id = $1")
        .bind(report.id)
        .fetch_optional(pool)
        .await?;

    let Some(stored) = stored else {
      warn!("submit: unknown assignment {}", report.id);
      continue;
    };
    if stored.worker_id != worker_id {
      warn!("submit: assignment {} does not belong to worker {}", report.id, worker_id);
      continue;
    }
    if !submittable(report.status) {
      warn!("submit: assignment {} arrived in status {:?}", report.id, report.status);
      continue;
    }
    // A replayed report of work already recorded is acknowledged without
    // another write, so a device retrying after a lost response settles.
    let replay = stored.submitted_to_box_at.is_some()
      && (stored.status == report.status
        || (stored.status == MicrotaskAssignmentStatus::Submitted
          && report.status == MicrotaskAssignmentStatus::Completed));
    if replay {
      accepted.push(report.id);
      continue;
    }
    if let Err(e) = ledger::admit_update(stored.last_updated_at, report.last_updated_at) {
      warn!("submit: assignment {} rejected: {}", report.id, e);
      continue;
    }
    if stored.status != report.status && !stored.status.can_transition(report.status) {
      warn!(
        "submit: assignment {} cannot move {:?} -> {:?}",
        report.id, stored.status, report.status
      );
      continue;
    }

    // Accepting a COMPLETED report is the submission itself.
    let store_status = if report.status == MicrotaskAssignmentStatus::Completed {
      MicrotaskAssignmentStatus::Submitted
    } else {
      report.status
    };

    // Stamped with this tier's clock so the box -> server filter picks
    // the row up as a fresh local change.
    sqlx::query(
      "UPDATE microtask_assignment
       SET status = $2, output = $3, output_file_id = $4, completed_at = $5,
           submitted_to_box_at = now(), last_updated_at = now()
       WHERE id = $1",
    )
    .bind(report.id)
    .bind(store_status)
    .bind(&report.output)
    .bind(report.output_file_id)
    .bind(report.completed_at)
    .execute(pool)
    .await?;

    accepted.push(report.id);
  }

  Ok(accepted)
}

/// Capability a task demands of its workers, read from task params.
fn required_capability(task: &TaskRecord) -> &str {
  task.params.get("skill").and_then(|s| s.as_str()).unwrap_or("READ")
}

/// Whether a worker's recorded skills qualify for a task.
pub fn task_matches_worker(task: &TaskRecord, skills: &[WorkerLanguageSkillRecord]) -> bool {
  let Some(skill) = skills.iter().find(|s| s.language == task.language) else {
    return false;
  };
  match required_capability(task) {
    "SPEAK" => skill.can_speak,
    "TYPE" => skill.can_type,
    _ => skill.can_read,
  }
}

/// Order items for assignment: sequential keeps ascending creation order
/// (id order is creation order within a node), random shuffles.
pub fn reorder<T>(items: &mut Vec<T>, order: AssignmentOrder, id: impl Fn(&T) -> i64) {
  match order {
    AssignmentOrder::Sequential => items.sort_by_key(id),
    AssignmentOrder::Random => items.shuffle(&mut rand::thread_rng()),
  }
}

fn assignable_task(task: &TaskRecord, now: DateTime<Utc>) -> bool {
  if !matches!(task.status, TaskStatus::Approved | TaskStatus::Assigned) {
    return false;
  }
  match task.deadline {
    Some(deadline) => deadline > now,
    None => true,
  }
}

/// Replenishment: compute eligible microtasks for a worker and park them
/// as PREASSIGNED. Runs only from the background consumer; a failure here
/// is logged by the caller and retried on the worker's next sync.
pub async fn preassign_microtasks_for_worker(
  pool: &Pool<Postgres>,
  worker: &WorkerRecord,
  max_credits: f32,
) -> Result<u64> {
  // A non-empty pool or open plate means nothing to do this round.
  let live: i64 = sqlx::query_scalar(
    "SELECT COUNT(*) FROM microtask_assignment
     WHERE worker_id = $1 AND status IN ('PREASSIGNED', 'ASSIGNED')",
  )
  .bind(worker.id)
  .fetch_one(pool)
  .await?;
  if live > 0 {
    return Ok(0);
  }

  let skills: Vec<WorkerLanguageSkillRecord> =
    sqlx::query_as("SELECT * FROM worker_language_skill WHERE worker_id = $1")
      .bind(worker.id)
      .fetch_all(pool)
      .await?;

  let tasks: Vec<TaskRecord> = sqlx::query_as(
    "SELECT t.* FROM task t
     JOIN task_assignment ta ON ta.task_id = t.id
     WHERE ta.box_id = $1 AND ta.status = 'ASSIGNED'
     ORDER BY t.id",
  )
  .bind(worker.box_id)
  .fetch_all(pool)
  .await?;

  let now = Utc::now();
  let mut available = max_credits;
  let mut preassigned = 0u64;

  for task in &tasks {
    if available <= 0.0 {
      break;
    }
    if !assignable_task(task, now) || !task_matches_worker(task, &skills) {
      continue;
    }

    let mut chosen: Vec<MicrotaskRecord> = Vec::new();
    match task.assignment_granularity {
      AssignmentGranularity::Microtask => {
        let mut candidates = free_microtasks(pool, task.id).await?;
        reorder(&mut candidates, task.microtask_assignment_order, |m| m.id);
        for microtask in candidates {
          if available - microtask.credits < 0.0 {
            break;
          }
          available -= microtask.credits;
          chosen.push(microtask);
        }
      }
      AssignmentGranularity::Group => {
        let mut groups = free_groups(pool, task.id).await?;
        reorder(&mut groups, task.group_assignment_order, |g| g.id);
        for group in groups {
          let mut members: Vec<MicrotaskRecord> =
            sqlx::query_as("SELECT * FROM microtask WHERE group_id = $1")
              .bind(group.id)
              .fetch_all(pool)
              .await?;
          let total: f32 = members.iter().map(|m| m.credits).sum();
          if available - total < 0.0 {
            break;
          }
          available -= total;
          reorder(&mut members, group.microtask_assignment_order, |m| m.id);
          chosen.extend(members);
        }
      }
    }

    for microtask in &chosen {
      let deadline = microtask.deadline.or(task.deadline);
      // The partial unique index on live bindings makes a concurrent
      // double-preassign lose cleanly; ON CONFLICT swallows the loss.
      let inserted = sqlx::query(
        "INSERT INTO microtask_assignment
           (box_id, microtask_id, worker_id, deadline, status)
         VALUES ($1, $2, $3, $4, 'PREASSIGNED')
         ON CONFLICT DO NOTHING",
      )
      .bind(worker.box_id)
      .bind(microtask.id)
      .bind(worker.id)
      .bind(deadline)
      .execute(pool)
      .await?
      .rows_affected();
      preassigned += inserted;
    }
  }

  if preassigned > 0 {
    info!("preassigned {} microtasks to worker {}", preassigned, worker.id);
  }
  Ok(preassigned)
}

async fn free_microtasks(pool: &Pool<Postgres>, task_id: i64) -> Result<Vec<MicrotaskRecord>> {
  let rows: Vec<MicrotaskRecord> = sqlx::query_as(
    "SELECT m.* FROM microtask m
     WHERE m.task_id = $1 AND m.group_id IS NULL AND m.status = 'INCOMPLETE'
       AND NOT EXISTS (
         SELECT 1 FROM microtask_assignment a
         WHERE a.microtask_id = m.id
           AND a.status IN ('PREASSIGNED', 'ASSIGNED', 'COMPLETED', 'SUBMITTED', 'VERIFIED')
       )",
  )
  .bind(task_id)
  .fetch_all(pool)
  .await?;
  Ok(rows)
}

async fn free_groups(pool: &Pool<Postgres>, task_id: i64) -> Result<Vec<MicrotaskGroupRecord>> {
  let rows: Vec<MicrotaskGroupRecord> = sqlx::query_as(
    "SELECT g.* FROM microtask_group g
     WHERE g.task_id = $1 AND g.status = 'INCOMPLETE'
       AND NOT EXISTS (
         SELECT 1 FROM microtask m
         JOIN microtask_assignment a ON a.microtask_id = m.id
         WHERE m.group_id = g.id
           AND a.status IN ('PREASSIGNED', 'ASSIGNED', 'COMPLETED', 'SUBMITTED', 'VERIFIED')
       )",
  )
  .bind(task_id)
  .fetch_all(pool)
  .await?;
  Ok(rows)
}

/// Box-driven deadline sweep. Idempotent: already-expired rows no longer
/// match the ASSIGNED filter.
pub async fn expire_overdue_assignments(pool: &Pool<Postgres>, box_id: i64) -> Result<u64> {
  let expired = sqlx::query(
    "UPDATE microtask_assignment
     SET status = 'EXPIRED', last_updated_at = now()
     WHERE box_id = $1 AND status = 'ASSIGNED'
       AND deadline IS NOT NULL AND deadline < now()",
  )
  .bind(box_id)
  .execute(pool)
  .await?
  .rows_affected();
  if expired > 0 {
    info!("expired {} overdue assignments for box {}", expired, box_id);
  }
  Ok(expired)
}

/// Server-side verification of submitted work. Grants the microtask's
/// full credit value; scenario-specific scoring hooks in above this
/// layer. VERIFIED rows flow back down on the next box pull.
pub async fn verify_assignments(pool: &Pool<Postgres>, ids: &[i64]) -> Result<u64> {
  let verified = sqlx::query(
    "UPDATE microtask_assignment a
     SET status = 'VERIFIED', credits = m.credits,
         verified_at = now(), last_updated_at = now()
     FROM microtask m
     WHERE a.microtask_id = m.id AND a.id = ANY($1) AND a.status = 'SUBMITTED'",
  )
  .bind(ids)
  .execute(pool)
  .await?
  .rows_affected();
  Ok(verified)
}

/// Current pool size for a worker, used to prioritize replenishment.
pub async fn preassigned_count(pool: &Pool<Postgres>, worker_id: i64) -> Result<i64> {
  let count: i64 = sqlx::query_scalar(
    "SELECT COUNT(*) FROM microtask_assignment WHERE worker_id = $1 AND status = 'PREASSIGNED'",
  )
  .bind(worker_id)
  .fetch_one(pool)
  .await?;
  Ok(count)
}

pub async fn worker_summary(pool: &Pool<Postgres>, worker_id: i64) -> Result<WorkerSummary> {
  let balance: Option<f32> = sqlx::query_scalar(
    "SELECT SUM(credits)::real FROM microtask_assignment
     WHERE worker_id = $1 AND status = 'VERIFIED'",
  )
  .bind(worker_id)
  .fetch_one(pool)
  .await?;

  let leaderboard: Vec<LeaderboardEntry> = sqlx::query_as(
    "SELECT w.id AS worker_id, w.full_name,
            COALESCE(SUM(a.credits), 0)::real AS credits
     FROM worker w
     LEFT JOIN microtask_assignment a
       ON a.worker_id = w.id AND a.status = 'VERIFIED'
     GROUP BY w.id, w.full_name
     ORDER BY credits DESC, w.id
     LIMIT 10",
  )
  .fetch_all(pool)
  .await?;

  Ok(WorkerSummary { balance: balance.unwrap_or(0.0), leaderboard })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  fn task(language: &str, params: serde_json::Value) -> TaskRecord {
    serde_json::from_value(json!({
      "id": 1, "scenario_name": "speech-data", "language": language,
      "name": "t", "description": "", "params": params,
      "input_file_id": null, "output_file_id": null, "budget": null,
      "deadline": null,
      "assignment_granularity": "MICROTASK",
      "group_assignment_order": "SEQUENTIAL",
      "microtask_assignment_order": "SEQUENTIAL",
      "status": "APPROVED",
      "created_at": "2024-01-01T00:00:00Z",
      "last_updated_at": "2024-01-01T00:00:00Z"
    }))
    .unwrap()
  }

  fn skill(language: &str, speak: bool, read: bool, type_: bool) -> WorkerLanguageSkillRecord {
    serde_json::from_value(json!({
      "id": 1, "local_id": 1, "box_id": 1, "worker_id": 1,
      "language": language, "can_speak": speak, "can_read": read,
      "can_type": type_, "proficiency": null,
      "created_at": "2024-01-01T00:00:00Z",
      "last_updated_at": "2024-01-01T00:00:00Z"
    }))
    .unwrap()
  }

  #[test]
  fn worker_without_the_task_language_never_matches() {
    let t = task("hi", json!({}));
    assert!(!task_matches_worker(&t, &[skill("mr", true, true, true)]));
    assert!(task_matches_worker(&t, &[skill("hi", false, true, false)]));
  }

  #[test]
  fn required_capability_is_read_by_default() {
    let t = task("hi", json!({}));
    assert!(!task_matches_worker(&t, &[skill("hi", true, false, true)]));

    let speech = task("hi", json!({"skill": "SPEAK"}));
    assert!(task_matches_worker(&speech, &[skill("hi", true, false, false)]));
    assert!(!task_matches_worker(&speech, &[skill("hi", false, true, true)]));

    let typing = task("hi", json!({"skill": "TYPE"}));
    assert!(task_matches_worker(&typing, &[skill("hi", false, false, true)]));
  }

  #[test]
  fn sequential_reorder_sorts_by_id() {
    let mut items = vec![(5, "e"), (2, "b"), (9, "x"), (1, "a")];
    reorder(&mut items, AssignmentOrder::Sequential, |i| i.0);
    assert_eq!(items.iter().map(|i| i.0).collect::<Vec<_>>(), vec![1, 2, 5, 9]);
  }

  #[test]
  fn random_reorder_is_a_permutation() {
    let mut items: Vec<i64> = (0..50).collect();
    reorder(&mut items, AssignmentOrder::Random, |i| *i);
    let mut sorted = items.clone();
    sorted.sort();
    assert_eq!(sorted, (0..50).collect::<Vec<i64>>());
  }

  #[test]
  fn submittable_statuses_are_the_worker_reported_ones() {
    use MicrotaskAssignmentStatus::*;
    for status in [Completed, Skipped, Expired] {
      assert!(submittable(status));
    }
    for status in [Preassigned, Assigned, Submitted, Verified] {
      assert!(!submittable(status));
    }
  }

  #[test]
  fn tasks_past_deadline_or_unapproved_are_not_assignable() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let mut t = task("hi", json!({}));
    assert!(assignable_task(&t, now));

    t.deadline = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    assert!(!assignable_task(&t, now));

    t.deadline = Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
    assert!(assignable_task(&t, now));

    t.status = TaskStatus::Created;
    assert!(!assignable_task(&t, now));
  }
}
