//! Global record identifiers. Every tier allocates ids without
//! coordination: the owning node's identity occupies the high bits and a
//! per-node sequence the low 48. Records created directly at the server
//! use the reserved identity zero.

use thiserror::Error;

/// Width of the local-sequence field.
pub const LOCAL_SEQUENCE_BITS: u32 = 48;

/// Largest local sequence that fits the bit budget.
pub const MAX_LOCAL_SEQUENCE: i64 = (1 << LOCAL_SEQUENCE_BITS) - 1;

/// Node identities must leave the sign bit untouched: 63 - 48 = 15 bits.
pub const MAX_NODE_IDENTITY: i64 = (1 << 15) - 1;

/// Identity under which server-created records are allocated.
pub const SERVER_IDENTITY: i64 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
  #[error("local sequence {0} exceeds the 48-bit budget")]
  SequenceOverflow(i64),
  #[error("node identity {0} outside [0, 32768)")]
  IdentityOutOfRange(i64),
}

/// Compute the global id for a record created by the given node. Pure and
/// deterministic: two nodes can never produce colliding ids, and a node
/// that exhausts its sequence budget gets an error rather than a wrap.
pub fn compute_global_id(node_identity: Option<i64>, local_sequence: i64) -> Result<i64, IdError> {
  let identity = node_identity.unwrap_or(SERVER_IDENTITY);
  if !(0..=MAX_NODE_IDENTITY).contains(&identity) {
    return Err(IdError::IdentityOutOfRange(identity));
  }
  if !(0..=MAX_LOCAL_SEQUENCE).contains(&local_sequence) {
    return Err(IdError::SequenceOverflow(local_sequence));
  }
  Ok((identity << LOCAL_SEQUENCE_BITS) + local_sequence)
}

/// Recover (node identity, local sequence) from a global id.
pub fn split_global_id(id: i64) -> (i64, i64) {
  (id >> LOCAL_SEQUENCE_BITS, id & MAX_LOCAL_SEQUENCE)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_id_for_box_three() {
    assert_eq!(compute_global_id(Some(3), 42), Ok((3 << 48) + 42));
  }

  #[test]
  fn distinct_boxes_never_collide_on_the_same_sequence() {
    let a = compute_global_id(Some(3), 42).unwrap();
    let b = compute_global_id(Some(7), 42).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn server_identity_is_zero() {
    assert_eq!(compute_global_id(None, 42), Ok(42));
    assert_eq!(
      compute_global_id(None, 42),
      compute_global_id(Some(SERVER_IDENTITY), 42)
    );
  }

  #[test]
  fn sequence_budget_is_enforced() {
    assert_eq!(compute_global_id(Some(1), MAX_LOCAL_SEQUENCE), Ok((1 << 48) + MAX_LOCAL_SEQUENCE));
    assert_eq!(
      compute_global_id(Some(1), MAX_LOCAL_SEQUENCE + 1),
      Err(IdError::SequenceOverflow(MAX_LOCAL_SEQUENCE + 1))
    );
    assert_eq!(compute_global_id(Some(1), -1), Err(IdError::SequenceOverflow(-1)));
  }

  #[test]
  fn identity_range_is_enforced() {
    assert!(compute_global_id(Some(MAX_NODE_IDENTITY), 0).is_ok());
    assert_eq!(
      compute_global_id(Some(MAX_NODE_IDENTITY + 1), 0),
      Err(IdError::IdentityOutOfRange(MAX_NODE_IDENTITY + 1))
    );
    assert_eq!(compute_global_id(Some(-2), 0), Err(IdError::IdentityOutOfRange(-2)));
  }

  #[test]
  fn split_inverts_compute_across_the_budget() {
    for (identity, sequence) in [(0, 0), (3, 42), (7, 42), (MAX_NODE_IDENTITY, MAX_LOCAL_SEQUENCE)] {
      let id = compute_global_id(Some(identity), sequence).unwrap();
      assert!(id >= 0);
      assert_eq!(split_global_id(id), (identity, sequence));
    }
  }
}
