use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
  Created,
  Submitted,
  Validated,
  Approved,
  Assigned,
  Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "microtask_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MicrotaskStatus {
  Incomplete,
  Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "microtask_group_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MicrotaskGroupStatus {
  Incomplete,
  Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_assignment_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskAssignmentStatus {
  Assigned,
  Sent,
  Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "assignment_granularity", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AssignmentGranularity {
  Group,
  Microtask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "assignment_order", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AssignmentOrder {
  Sequential,
  Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "file_creator", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum FileCreator {
  Server,
  Box,
  Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "checksum_algorithm", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ChecksumAlgorithm {
  Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "microtask_assignment_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MicrotaskAssignmentStatus {
  Preassigned,
  Assigned,
  Completed,
  Skipped,
  Expired,
  Submitted,
  Verified,
}

impl MicrotaskAssignmentStatus {
  /// Whether a status change is legal. Same-status writes are field
  /// updates, not transitions, and are admitted elsewhere.
  pub fn can_transition(self, next: Self) -> bool {
    use MicrotaskAssignmentStatus::*;
    matches!(
      (self, next),
      (Preassigned, Assigned)
        | (Assigned, Completed)
        | (Assigned, Skipped)
        | (Assigned, Expired)
        | (Completed, Submitted)
        | (Submitted, Verified)
        // A server verification carrying a newer timestamp overrides a
        // box-side expiry that raced with the submission.
        | (Expired, Verified)
    )
  }

  pub fn is_terminal(self) -> bool {
    use MicrotaskAssignmentStatus::*;
    matches!(self, Verified | Expired | Skipped)
  }

  /// Statuses that keep the underlying microtask bound to its worker. A
  /// microtask with a live assignment can never be handed to anyone else.
  pub fn is_live_binding(self) -> bool {
    use MicrotaskAssignmentStatus::*;
    matches!(self, Preassigned | Assigned | Completed | Submitted | Verified)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BoxRecord {
  pub id: i64,
  pub creation_code: String,
  pub name: String,
  pub url: Option<String>,
  pub key: Option<String>,
  pub last_sent_to_server_at: DateTime<Utc>,
  pub last_received_from_server_at: DateTime<Utc>,
  pub params: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
  pub id: i64,
  pub local_id: i64,
  pub box_id: i64,
  pub access_code: String,
  pub id_token: Option<String>,
  pub phone_number: Option<String>,
  pub full_name: Option<String>,
  pub year_of_birth: Option<String>,
  pub gender: Option<String>,
  pub app_language: Option<String>,
  pub last_sent_to_box_at: DateTime<Utc>,
  pub last_received_from_box_at: DateTime<Utc>,
  pub last_sent_to_server_at: DateTime<Utc>,
  pub last_received_from_server_at: DateTime<Utc>,
  pub params: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerLanguageSkillRecord {
  pub id: i64,
  pub local_id: i64,
  pub box_id: i64,
  pub worker_id: i64,
  pub language: String,
  pub can_speak: bool,
  pub can_read: bool,
  pub can_type: bool,
  pub proficiency: Option<f32>,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecord {
  pub id: i64,
  pub scenario_name: String,
  pub language: String,
  pub name: String,
  pub description: String,
  pub params: serde_json::Value,
  pub input_file_id: Option<i64>,
  pub output_file_id: Option<i64>,
  pub budget: Option<f32>,
  pub deadline: Option<DateTime<Utc>>,
  pub assignment_granularity: AssignmentGranularity,
  pub group_assignment_order: AssignmentOrder,
  pub microtask_assignment_order: AssignmentOrder,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MicrotaskGroupRecord {
  pub id: i64,
  pub task_id: i64,
  pub microtask_assignment_order: AssignmentOrder,
  pub status: MicrotaskGroupStatus,
  pub params: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MicrotaskRecord {
  pub id: i64,
  pub task_id: i64,
  pub group_id: Option<i64>,
  pub input: serde_json::Value,
  pub input_file_id: Option<i64>,
  pub deadline: Option<DateTime<Utc>>,
  pub credits: f32,
  pub status: MicrotaskStatus,
  pub params: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskAssignmentRecord {
  pub id: i64,
  pub task_id: i64,
  pub box_id: i64,
  pub policy: String,
  pub params: serde_json::Value,
  pub status: TaskAssignmentStatus,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MicrotaskAssignmentRecord {
  pub id: i64,
  pub local_id: i64,
  pub box_id: i64,
  pub microtask_id: i64,
  pub worker_id: i64,
  pub deadline: Option<DateTime<Utc>>,
  pub status: MicrotaskAssignmentStatus,
  pub output: serde_json::Value,
  pub output_file_id: Option<i64>,
  pub credits: Option<f32>,
  pub completed_at: Option<DateTime<Utc>>,
  pub submitted_to_box_at: Option<DateTime<Utc>>,
  pub verified_at: Option<DateTime<Utc>>,
  pub params: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

impl MicrotaskAssignmentRecord {
  /// Names of the output files recorded by the task UI, if any.
  pub fn output_file_names(&self) -> Vec<String> {
    match self.output.get("files") {
      Some(serde_json::Value::Array(names)) => names
        .iter()
        .filter_map(|n| n.as_str().map(|s| s.to_string()))
        .collect(),
      _ => vec![],
    }
  }

  pub fn has_output_files(&self) -> bool {
    !self.output_file_names().is_empty()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KaryaFileRecord {
  pub id: i64,
  pub local_id: i64,
  pub box_id: Option<i64>,
  pub worker_id: Option<i64>,
  pub container_name: String,
  pub name: String,
  pub url: Option<String>,
  pub creator: FileCreator,
  pub algorithm: ChecksumAlgorithm,
  pub checksum: String,
  pub in_box: bool,
  pub in_server: bool,
  pub params: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::MicrotaskAssignmentStatus::*;
  use super::MicrotaskAssignmentRecord;

  #[test]
  fn lifecycle_happy_path_transitions_are_allowed() {
    let path = [
      (Preassigned, Assigned),
      (Assigned, Completed),
      (Completed, Submitted),
      (Submitted, Verified),
    ];
    for (from, to) in path {
      assert!(from.can_transition(to), "expected {:?} -> {:?}", from, to);
    }
  }

  #[test]
  fn assigned_work_can_be_skipped_or_expired() {
    assert!(Assigned.can_transition(Skipped));
    assert!(Assigned.can_transition(Expired));
  }

  #[test]
  fn expiry_is_not_reversible() {
    assert!(!Expired.can_transition(Assigned));
    assert!(!Expired.can_transition(Preassigned));
    assert!(!Expired.can_transition(Completed));
  }

  #[test]
  fn verification_overrides_a_raced_expiry() {
    assert!(Expired.can_transition(Verified));
    assert!(!Verified.can_transition(Expired));
  }

  #[test]
  fn no_shortcut_from_assignment_to_submission() {
    assert!(!Assigned.can_transition(Submitted));
    assert!(!Preassigned.can_transition(Completed));
    assert!(!Assigned.can_transition(Verified));
  }

  #[test]
  fn terminal_states() {
    for status in [Verified, Expired, Skipped] {
      assert!(status.is_terminal());
    }
    for status in [Preassigned, Assigned, Completed, Submitted] {
      assert!(!status.is_terminal());
    }
  }

  #[test]
  fn skipped_and_expired_release_the_microtask() {
    assert!(!Skipped.is_live_binding());
    assert!(!Expired.is_live_binding());
    for status in [Preassigned, Assigned, Completed, Submitted, Verified] {
      assert!(status.is_live_binding());
    }
  }

  #[test]
  fn output_file_names_handles_missing_and_malformed_output() {
    let mut record: MicrotaskAssignmentRecord =
      serde_json::from_value(serde_json::json!({
        "id": 1, "local_id": 1, "box_id": 1, "microtask_id": 1, "worker_id": 1,
        "deadline": null, "status": "COMPLETED",
        "output": {"files": ["a.wav", "b.wav"]},
        "output_file_id": null, "credits": null, "completed_at": null,
        "submitted_to_box_at": null, "verified_at": null, "params": {},
        "created_at": "2024-01-01T00:00:00Z",
        "last_updated_at": "2024-01-01T00:00:00Z"
      }))
      .unwrap();
    assert_eq!(record.output_file_names(), vec!["a.wav", "b.wav"]);
    assert!(record.has_output_files());

    record.output = serde_json::json!({});
    assert!(record.output_file_names().is_empty());
    record.output = serde_json::Value::Null;
    assert!(!record.has_output_files());
  }
}
