//! Monotonicity guard for record updates. Last-writer-wins with a hard
//! floor: an update whose timestamp is strictly earlier than the stored
//! one is rejected, everything else is applied. This is the system's
//! entire conflict policy; divergent later writes simply win on arrival.
//!
//! The same rule is installed as the `check_last_updated` trigger so
//! direct writers cannot bypass it. This module is the in-process arm,
//! used where a sync batch must skip and report stale rows one by one.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("update from the past: incoming {incoming} precedes stored {stored}")]
pub struct StaleUpdate {
  pub stored: DateTime<Utc>,
  pub incoming: DateTime<Utc>,
}

/// Admit or reject an update against the stored timestamp. Equal
/// timestamps are admitted: a replayed write of the same version is
/// harmless, and rejecting it would fail idempotent retries.
pub fn admit_update(stored: DateTime<Utc>, incoming: DateTime<Utc>) -> Result<(), StaleUpdate> {
  if incoming < stored {
    Err(StaleUpdate { stored, incoming })
  } else {
    Ok(())
  }
}

/// Error text raised by the storage-layer trigger for the same violation.
/// Apply paths that let the trigger do the check match on this to fold
/// the failure into a per-record rejection.
pub const TRIGGER_REJECTION: &str = "Update from the past";

pub fn is_trigger_rejection(err: &sqlx::Error) -> bool {
  match err {
    sqlx::Error::Database(db) => db.message().contains(TRIGGER_REJECTION),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
  }

  #[test]
  fn stale_update_is_rejected_and_reports_both_timestamps() {
    let err = admit_update(at(100), at(99)).unwrap_err();
    assert_eq!(err.stored, at(100));
    assert_eq!(err.incoming, at(99));
  }

  #[test]
  fn equal_timestamp_is_admitted() {
    assert!(admit_update(at(100), at(100)).is_ok());
  }

  #[test]
  fn newer_update_is_admitted() {
    assert!(admit_update(at(100), at(101)).is_ok());
  }
}
