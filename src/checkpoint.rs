//! Per-tenant, per-export-contract checkpoint map (spec.md §3 "Checkpoint",
//! §4.7 step 5/7). Every `*.export` operation stores the checkpoint it just
//! issued here, keyed by `(tenant_id, contract)`, so a later call presenting
//! `cursor_after` can be checked against exactly the checkpoint that minted
//! that cursor rather than trusting the caller's word for it.
//!
//! Whether checkpoint enforcement is a process-wide switch or a per-tenant
//! one is left ambiguous by spec.md §9; this mirrors the source's
//! process-wide semantics (`Config`'s `*_checkpoint_enforce` flags apply to
//! every tenant alike) rather than inventing per-tenant overrides.

use crate::attestation::Checkpoint;
use crate::error::CoreError;
use std::collections::HashMap;

#[derive(Clone)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    attestation_chain_hash: String,
    exported_at_ms: i64,
}

/// Export contract identifiers are free-form strings (e.g.
/// `"trust_safety_audit"`, `"inclusion_proof_linkage"`) chosen by each domain
/// module; they only need to be stable and distinct per export surface.
#[derive(Default)]
pub struct CheckpointRegistry {
    by_scope: HashMap<(String, String), StoredCheckpoint>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist the checkpoint just issued for `(tenant_id, contract)`,
    /// overwriting whatever was there before (checkpoints are single-slot per
    /// scope: only the most recently issued one is resumable, matching
    /// spec.md's "stored under a per-tenant, per-export-contract map").
    pub fn store(
        &mut self,
        tenant_id: &str,
        contract: &str,
        checkpoint: Checkpoint,
        attestation_chain_hash: String,
        exported_at_ms: i64,
    ) {
        self.by_scope.insert(
            (tenant_id.to_string(), contract.to_string()),
            StoredCheckpoint {
                checkpoint,
                attestation_chain_hash,
                exported_at_ms,
            },
        );
    }

    /// Drop the stored checkpoint for `(tenant_id, contract)` if it is older
    /// than `cutoff_ms` (spec.md §3 "Checkpoints prune when `now -
    /// exported_at > retention_window`"). Pruning only removes the ability to
    /// resume via a stale cursor; it never touches the underlying ledger.
    pub fn prune(&mut self, tenant_id: &str, contract: &str, cutoff_ms: i64) {
        let key = (tenant_id.to_string(), contract.to_string());
        if let Some(existing) = self.by_scope.get(&key) {
            if existing.exported_at_ms < cutoff_ms {
                self.by_scope.remove(&key);
            }
        }
    }

    /// Validate a continuation request (spec.md §4.7 step 5): if
    /// `cursor_after` is present, `attestation_after` and `checkpoint_after`
    /// are both required and must match the stored checkpoint's
    /// `next_cursor`, `attestation_chain_hash`, and `context_fingerprint`.
    /// Mismatches report the expected values explicitly in `error.details`.
    pub fn validate_continuation(
        &self,
        tenant_id: &str,
        contract: &str,
        cursor_after: Option<&str>,
        attestation_after: Option<&str>,
        checkpoint_after: Option<&str>,
        context_fingerprint: &str,
    ) -> Result<(), CoreError> {
        let Some(cursor_after) = cursor_after else {
            return Ok(());
        };

        let (attestation_after, checkpoint_after) = match (attestation_after, checkpoint_after) {
            (Some(a), Some(c)) => (a, c),
            _ => {
                return Err(CoreError::constraint_violation(
                    "checkpoint_continuation_missing_anchors",
                ))
            }
        };

        let stored = self
            .by_scope
            .get(&(tenant_id.to_string(), contract.to_string()))
            .ok_or_else(|| CoreError::constraint_violation("checkpoint_after_not_found"))?;

        let expected_cursor = stored.checkpoint.next_cursor.as_deref().unwrap_or("");
        let matches = expected_cursor == cursor_after
            && stored.attestation_chain_hash == attestation_after
            && stored.checkpoint.checkpoint_hash == checkpoint_after
            && stored.checkpoint.context_fingerprint == context_fingerprint;

        if matches {
            Ok(())
        } else {
            Err(CoreError::with_details(
                crate::error::ErrorCode::ConstraintViolation,
                "checkpoint attestation mismatch",
                serde_json::json!({
                    "reason_code": "checkpoint_attestation_mismatch",
                    "expected_next_cursor": stored.checkpoint.next_cursor,
                    "expected_attestation_chain_hash": stored.attestation_chain_hash,
                    "expected_checkpoint_hash": stored.checkpoint.checkpoint_hash,
                }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::make_checkpoint;

    #[test]
    fn first_call_with_no_cursor_needs_no_anchors() {
        let registry = CheckpointRegistry::new();
        assert!(registry
            .validate_continuation("t1", "contract", None, None, None, "fp")
            .is_ok());
    }

    #[test]
    fn cursor_without_anchors_is_rejected() {
        let registry = CheckpointRegistry::new();
        let err = registry
            .validate_continuation("t1", "contract", Some("cur"), None, None, "fp")
            .unwrap_err();
        assert_eq!(
            err.reason_code(),
            Some("checkpoint_continuation_missing_anchors")
        );
    }

    #[test]
    fn cursor_with_no_stored_checkpoint_is_not_found() {
        let registry = CheckpointRegistry::new();
        let err = registry
            .validate_continuation("t1", "contract", Some("cur"), Some("a"), Some("c"), "fp")
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("checkpoint_after_not_found"));
    }

    #[test]
    fn stale_attestation_is_rejected_with_expected_values() {
        let mut registry = CheckpointRegistry::new();
        let checkpoint = make_checkpoint("chain-1", Some("cur-1"), "fp");
        registry.store("t1", "contract", checkpoint.clone(), "chain-1".to_string(), 1000);

        let err = registry
            .validate_continuation(
                "t1",
                "contract",
                Some("cur-1"),
                Some("stale-chain"),
                &checkpoint.checkpoint_hash,
                "fp",
            )
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("checkpoint_attestation_mismatch"));
        assert_eq!(
            err.details.as_ref().unwrap().get("expected_attestation_chain_hash").unwrap(),
            "chain-1"
        );
    }

    #[test]
    fn matching_anchors_validate() {
        let mut registry = CheckpointRegistry::new();
        let checkpoint = make_checkpoint("chain-1", Some("cur-1"), "fp");
        registry.store("t1", "contract", checkpoint.clone(), "chain-1".to_string(), 1000);
        assert!(registry
            .validate_continuation(
                "t1",
                "contract",
                Some("cur-1"),
                Some("chain-1"),
                &checkpoint.checkpoint_hash,
                "fp",
            )
            .is_ok());
    }

    #[test]
    fn prune_drops_checkpoints_older_than_cutoff() {
        let mut registry = CheckpointRegistry::new();
        let checkpoint = make_checkpoint("chain-1", Some("cur-1"), "fp");
        registry.store("t1", "contract", checkpoint, "chain-1".to_string(), 1000);
        registry.prune("t1", "contract", 500);
        assert!(registry
            .by_scope
            .contains_key(&("t1".to_string(), "contract".to_string())));
        registry.prune("t1", "contract", 2000);
        assert!(!registry
            .by_scope
            .contains_key(&("t1".to_string(), "contract".to_string())));
    }
}
