//! Generic export engine (spec.md §4.7): `filter -> retention cutoff ->
//! stable sort (recorded_at_ms, id) -> cursor slice -> attest -> checkpoint`.
//!
//! Every `*.export` operation across the domain modules (liquidity,
//! trust & safety, ...) funnels its page through [`run_export`] rather than
//! re-implementing the pipeline, so the ordering, retention, and attestation
//! rules stay identical everywhere an export exists.

use crate::attestation::{
    attest, context_fingerprint, make_checkpoint, Attestation, AttestationSigner, Checkpoint,
};
use crate::checkpoint::CheckpointRegistry;
use crate::error::CoreError;
use crate::ledger::{Ledger, LedgerEntry};
use serde_json::Value;

pub struct ExportRequest<'a> {
    pub tenant_id: &'a str,
    pub kind: &'a str,
    pub retention_cutoff_ms: Option<i64>,
    pub cursor: Option<&'a str>,
    pub page_size: usize,
    pub previous_chain_hash: &'a str,
}

/// A continuation request as presented by a caller resuming a paged export
/// (spec.md §4.7 step 5): the cursor plus the two anchors that must match the
/// checkpoint which minted it.
#[derive(Default)]
pub struct ContinuationRequest<'a> {
    pub cursor_after: Option<&'a str>,
    pub attestation_after: Option<&'a str>,
    pub checkpoint_after: Option<&'a str>,
}

pub struct ExportPage {
    pub entries: Vec<LedgerEntry>,
    pub attestation: Attestation,
    pub checkpoint: Checkpoint,
}

/// Cursor format: the id of the last entry already returned. Entries are
/// sliced strictly after that id in the stable `(recorded_at_ms, id)` order.
/// spec.md §4.7 step 4: a supplied cursor not found in the sorted, filtered
/// list is a `CONSTRAINT_VIOLATION`, not a silent empty page.
fn cursor_position(sorted: &[LedgerEntry], cursor: Option<&str>) -> Result<usize, CoreError> {
    match cursor {
        None => Ok(0),
        Some(last_id) => sorted
            .iter()
            .position(|e| e.id == last_id)
            .map(|i| i + 1)
            .ok_or_else(|| CoreError::constraint_violation("export_cursor_not_found")),
    }
}

/// Run one export page over an already-sorted, already-filtered entry set.
/// Callers are expected to have applied their domain-specific predicate
/// (redaction visibility, tenant scoping, etc.) before calling this; this
/// function only owns retention cutoff, stable ordering, pagination, and
/// attestation/checkpointing, which are identical across every exporter.
pub fn run_export(
    req: &ExportRequest,
    mut sorted_entries: Vec<LedgerEntry>,
    signer: &AttestationSigner,
) -> Result<ExportPage, CoreError> {
    if let Some(cutoff) = req.retention_cutoff_ms {
        sorted_entries.retain(|e| e.recorded_at_ms >= cutoff);
    }
    sorted_entries.sort_by(|a, b| {
        a.recorded_at_ms
            .cmp(&b.recorded_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });

    let start = cursor_position(&sorted_entries, req.cursor)?;
    let end = (start + req.page_size).min(sorted_entries.len());
    let page: Vec<LedgerEntry> = sorted_entries[start..end].to_vec();

    let payloads: Vec<Value> = page.iter().map(|e| e.payload.clone()).collect();
    let attestation = attest(req.previous_chain_hash, &payloads, signer);

    let next_cursor = if end < sorted_entries.len() {
        page.last().map(|e| e.id.clone())
    } else {
        None
    };
    let fp = context_fingerprint(&[
        req.tenant_id,
        req.kind,
        &req.retention_cutoff_ms.map(|c| c.to_string()).unwrap_or_default(),
    ]);
    let checkpoint = make_checkpoint(&attestation.chain_hash, next_cursor.as_deref(), &fp);

    Ok(ExportPage {
        entries: page,
        attestation,
        checkpoint,
    })
}

/// The full continuation-aware export flow used by every `*.export`
/// operation: validate the caller's continuation anchors against whatever
/// checkpoint this `(tenant_id, contract)` last issued, run the page, store
/// the freshly issued checkpoint for next time, and prune anything older
/// than `checkpoint_retention_cutoff_ms`.
///
/// `contract` identifies the export surface (e.g. `"trust_safety_audit"`)
/// independent of `req.kind`, which is the ledger's own entry-kind filter —
/// in practice the two are usually the same string, but keeping them
/// separate lets an export span more than one ledger kind without losing a
/// distinct checkpoint identity.
#[allow(clippy::too_many_arguments)]
pub fn export_with_continuation(
    registry: &mut CheckpointRegistry,
    contract: &str,
    req: &ExportRequest,
    continuation: &ContinuationRequest,
    sorted_entries: Vec<LedgerEntry>,
    now_ms: i64,
    checkpoint_retention_cutoff_ms: Option<i64>,
    signer: &AttestationSigner,
) -> Result<ExportPage, CoreError> {
    let fp = context_fingerprint(&[
        req.tenant_id,
        req.kind,
        &req.retention_cutoff_ms.map(|c| c.to_string()).unwrap_or_default(),
    ]);

    registry.validate_continuation(
        req.tenant_id,
        contract,
        continuation.cursor_after,
        continuation.attestation_after,
        continuation.checkpoint_after,
        &fp,
    )?;

    let page = run_export(req, sorted_entries, signer)?;

    registry.store(
        req.tenant_id,
        contract,
        page.checkpoint.clone(),
        page.attestation.chain_hash.clone(),
        now_ms,
    );
    if let Some(cutoff) = checkpoint_retention_cutoff_ms {
        registry.prune(req.tenant_id, contract, cutoff);
    }

    Ok(page)
}

/// Convenience wrapper over [`export_with_continuation`] for the common case
/// of exporting one `(tenant_id, kind)` ledger scope wholesale: every domain
/// module with a plain audit export (trust & safety, inclusion proof,
/// transparency, staging evidence, compensation, the steam adapter, and the
/// three liquidity sub-ledgers) calls this instead of re-deriving
/// `sorted_scope` + `ExportRequest` by hand.
#[allow(clippy::too_many_arguments)]
pub fn export_ledger_scope(
    ledger: &Ledger,
    registry: &mut CheckpointRegistry,
    tenant_id: &str,
    kind: &str,
    contract: &str,
    continuation: &ContinuationRequest,
    page_size: usize,
    retention_cutoff_ms: Option<i64>,
    checkpoint_retention_cutoff_ms: Option<i64>,
    previous_chain_hash: &str,
    now_ms: i64,
    signer: &AttestationSigner,
) -> Result<ExportPage, CoreError> {
    let sorted = ledger.sorted_scope(tenant_id, kind);
    let req = ExportRequest {
        tenant_id,
        kind,
        retention_cutoff_ms,
        cursor: continuation.cursor_after,
        page_size,
        previous_chain_hash,
    };
    export_with_continuation(
        registry,
        contract,
        &req,
        continuation,
        sorted,
        now_ms,
        checkpoint_retention_cutoff_ms,
        signer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, ms: i64) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            kind: "decision".to_string(),
            recorded_at_iso: "2025-01-01T00:00:00.000Z".to_string(),
            recorded_at_ms: ms,
            payload: json!({"id": id}),
        }
    }

    #[test]
    fn paginates_in_stable_order_and_sets_next_cursor() {
        let entries = vec![entry("e3", 3), entry("e1", 1), entry("e2", 2)];
        let req = ExportRequest {
            tenant_id: "t1",
            kind: "decision",
            retention_cutoff_ms: None,
            cursor: None,
            page_size: 2,
            previous_chain_hash: &crate::attestation::genesis(),
        };
        let signer = crate::attestation::AttestationSigner::new("test-key", "test-secret");
        let page1 = run_export(&req, entries.clone(), &signer).unwrap();
        assert_eq!(
            page1.entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["e1", "e2"]
        );
        assert_eq!(page1.checkpoint.next_cursor.as_deref(), Some("e2"));

        let req2 = ExportRequest {
            cursor: page1.checkpoint.next_cursor.as_deref(),
            previous_chain_hash: &page1.attestation.chain_hash,
            ..req
        };
        let page2 = run_export(&req2, entries, &signer).unwrap();
        assert_eq!(
            page2.entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["e3"]
        );
        assert_eq!(page2.checkpoint.next_cursor, None);
    }

    #[test]
    fn retention_cutoff_drops_old_entries() {
        let entries = vec![entry("e1", 1), entry("e2", 100)];
        let req = ExportRequest {
            tenant_id: "t1",
            kind: "decision",
            retention_cutoff_ms: Some(50),
            cursor: None,
            page_size: 10,
            previous_chain_hash: &crate::attestation::genesis(),
        };
        let signer = crate::attestation::AttestationSigner::new("test-key", "test-secret");
        let page = run_export(&req, entries, &signer).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].id, "e2");
    }

    #[test]
    fn unrecognized_cursor_is_rejected_not_clamped() {
        let entries = vec![entry("e1", 1), entry("e2", 2)];
        let req = ExportRequest {
            tenant_id: "t1",
            kind: "decision",
            retention_cutoff_ms: None,
            cursor: Some("does-not-exist"),
            page_size: 10,
            previous_chain_hash: &crate::attestation::genesis(),
        };
        let signer = crate::attestation::AttestationSigner::new("test-key", "test-secret");
        let err = run_export(&req, entries, &signer).unwrap_err();
        assert_eq!(err.reason_code(), Some("export_cursor_not_found"));
    }

    #[test]
    fn continuation_flow_validates_and_reissues_checkpoints() {
        let mut registry = CheckpointRegistry::new();
        let signer = crate::attestation::AttestationSigner::new("test-key", "test-secret");
        let entries = vec![entry("e1", 1), entry("e2", 2), entry("e3", 3)];
        let req1 = ExportRequest {
            tenant_id: "t1",
            kind: "decision",
            retention_cutoff_ms: None,
            cursor: None,
            page_size: 2,
            previous_chain_hash: &crate::attestation::genesis(),
        };
        let page1 = export_with_continuation(
            &mut registry,
            "decision_audit",
            &req1,
            &ContinuationRequest::default(),
            entries.clone(),
            1_000,
            None,
            &signer,
        )
        .unwrap();
        assert_eq!(page1.checkpoint.next_cursor.as_deref(), Some("e2"));

        let continuation = ContinuationRequest {
            cursor_after: page1.checkpoint.next_cursor.as_deref(),
            attestation_after: Some(&page1.attestation.chain_hash),
            checkpoint_after: Some(&page1.checkpoint.checkpoint_hash),
        };
        let req2 = ExportRequest {
            cursor: page1.checkpoint.next_cursor.as_deref(),
            previous_chain_hash: &page1.attestation.chain_hash,
            ..req1
        };
        let page2 = export_with_continuation(
            &mut registry,
            "decision_audit",
            &req2,
            &continuation,
            entries.clone(),
            2_000,
            None,
            &signer,
        )
        .unwrap();
        assert_eq!(
            page2.entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["e3"]
        );

        let forged = ContinuationRequest {
            cursor_after: Some("e2"),
            attestation_after: Some("not-the-real-chain"),
            checkpoint_after: Some(&page1.checkpoint.checkpoint_hash),
        };
        let err = export_with_continuation(
            &mut registry,
            "decision_audit",
            &req2,
            &forged,
            entries,
            3_000,
            None,
            &signer,
        )
        .unwrap_err();
        assert_eq!(err.reason_code(), Some("checkpoint_attestation_mismatch"));
    }

    #[test]
    fn export_ledger_scope_reads_straight_from_the_ledger() {
        let mut ledger = Ledger::new();
        ledger.append("e1", "t1", "signal", "2025-01-01T00:00:00.000Z", 1, json!({"x": 1}));
        ledger.append("e2", "t1", "signal", "2025-01-01T00:00:01.000Z", 2, json!({"x": 2}));
        let mut registry = CheckpointRegistry::new();

        let page = export_ledger_scope(
            &ledger,
            &mut registry,
            "t1",
            "signal",
            "trust_safety_audit",
            &ContinuationRequest::default(),
            10,
            None,
            None,
            &crate::attestation::genesis(),
            1_000,
            &crate::attestation::AttestationSigner::new("test-key", "test-secret"),
        )
        .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.checkpoint.next_cursor, None);
    }
}
