//! Inclusion-proof linkage (spec.md §3, §4.11): a per-partner monotone chain
//! linking a signed receipt, a custody snapshot/holding, a custody inclusion
//! proof, and a transparency publication. `record` verifies the receipt
//! signature, that the referenced custody snapshot and holding exist, builds
//! and verifies the custody inclusion proof, confirms the transparency
//! publication's `artifact_refs` cite both `receipt:<id>` and
//! `custody_snapshot:<id>`, and appends a new `linkage_hash` chained to the
//! previous one. Signature verification here is a deterministic stand-in —
//! spec.md §1 puts cryptographic analysis of the actual scheme out of scope.

use crate::attestation::AttestationSigner;
use crate::canonical::{canonical_bytes, chain_hash, hex_sha256};
use crate::checkpoint::CheckpointRegistry;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub const LEDGER_KIND: &str = "inclusion_proof_linkage";
pub const EXPORT_CONTRACT: &str = "inclusion_proof_linkage";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: String,
    pub partner_id: String,
    pub payload: Value,
    pub signature: String,
}

/// Deterministic "signature": `H(canonical(payload) || receipt_id)`.
pub fn sign_receipt(receipt_id: &str, payload: &Value) -> String {
    let mut bytes = canonical_bytes(payload);
    bytes.extend_from_slice(receipt_id.as_bytes());
    hex_sha256(&bytes)
}

pub fn verify_receipt(receipt: &Receipt) -> bool {
    receipt.signature == sign_receipt(&receipt.receipt_id, &receipt.payload)
}

/// Deterministic custody inclusion proof: `H(snapshot_id || holding_id)`.
pub fn build_custody_inclusion_proof(snapshot_id: &str, holding_id: &str) -> String {
    chain_hash(&[snapshot_id, holding_id])
}

pub fn verify_custody_inclusion_proof(proof: &str, snapshot_id: &str, holding_id: &str) -> bool {
    proof == build_custody_inclusion_proof(snapshot_id, holding_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linkage {
    pub linkage_id: String,
    pub partner_id: String,
    pub receipt_id: String,
    pub custody_snapshot_id: String,
    pub holding_id: String,
    pub custody_inclusion_proof: String,
    pub transparency_publication_id: String,
    pub previous_linkage_hash: Option<String>,
    pub linkage_hash: String,
    pub recorded_at: String,
}

#[derive(Default)]
pub struct InclusionProofStore {
    pub chains: HashMap<String, Vec<Linkage>>,
}

impl InclusionProofStore {
    fn previous_hash(&self, partner_id: &str) -> Option<String> {
        self.chains
            .get(partner_id)
            .and_then(|chain| chain.last())
            .map(|l| l.linkage_hash.clone())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        ledger: &mut Ledger,
        linkage_id: &str,
        receipt: &Receipt,
        known_snapshots: &HashSet<String>,
        known_holdings: &HashSet<String>,
        custody_snapshot_id: &str,
        holding_id: &str,
        transparency_publication_id: &str,
        transparency_artifact_refs: &[String],
        now_iso: &str,
        now_ms: i64,
    ) -> CoreResult<Linkage> {
        if !verify_receipt(receipt) {
            return Err(CoreError::constraint_violation(
                "inclusion_proof_receipt_signature_invalid",
            ));
        }
        if !known_snapshots.contains(custody_snapshot_id) {
            return Err(CoreError::not_found("inclusion_proof_custody_snapshot_not_found"));
        }
        if !known_holdings.contains(holding_id) {
            return Err(CoreError::not_found("inclusion_proof_holding_not_found"));
        }

        let proof = build_custody_inclusion_proof(custody_snapshot_id, holding_id);
        if !verify_custody_inclusion_proof(&proof, custody_snapshot_id, holding_id) {
            return Err(CoreError::constraint_violation(
                "inclusion_proof_custody_proof_invalid",
            ));
        }

        let receipt_ref = format!("receipt:{}", receipt.receipt_id);
        let snapshot_ref = format!("custody_snapshot:{custody_snapshot_id}");
        if !transparency_artifact_refs.contains(&receipt_ref)
            || !transparency_artifact_refs.contains(&snapshot_ref)
        {
            return Err(CoreError::constraint_violation(
                "inclusion_proof_transparency_publication_missing_refs",
            ));
        }

        let previous_linkage_hash = self.previous_hash(&receipt.partner_id);
        let fields = serde_json::json!({
            "linkage_id": linkage_id,
            "partner_id": receipt.partner_id,
            "receipt_id": receipt.receipt_id,
            "custody_snapshot_id": custody_snapshot_id,
            "holding_id": holding_id,
            "custody_inclusion_proof": proof,
            "transparency_publication_id": transparency_publication_id,
        });
        let fields_hash = hex_sha256(&canonical_bytes(&fields));
        let linkage_hash = chain_hash(&[previous_linkage_hash.as_deref().unwrap_or(""), &fields_hash]);

        let linkage = Linkage {
            linkage_id: linkage_id.to_string(),
            partner_id: receipt.partner_id.clone(),
            receipt_id: receipt.receipt_id.clone(),
            custody_snapshot_id: custody_snapshot_id.to_string(),
            holding_id: holding_id.to_string(),
            custody_inclusion_proof: proof,
            transparency_publication_id: transparency_publication_id.to_string(),
            previous_linkage_hash,
            linkage_hash,
            recorded_at: now_iso.to_string(),
        };
        self.chains
            .entry(receipt.partner_id.clone())
            .or_default()
            .push(linkage.clone());

        let id = format!("{linkage_id}:{}", &linkage.linkage_hash[..16]);
        ledger.append(
            id,
            linkage.partner_id.clone(),
            LEDGER_KIND,
            now_iso.to_string(),
            now_ms,
            serde_json::json!(linkage),
        );
        Ok(linkage)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        ledger: &Ledger,
        registry: &mut CheckpointRegistry,
        partner_id: &str,
        continuation: &ContinuationRequest,
        page_size: usize,
        retention_cutoff_ms: Option<i64>,
        checkpoint_retention_cutoff_ms: Option<i64>,
        previous_chain_hash: &str,
        now_ms: i64,
        signer: &AttestationSigner,
    ) -> CoreResult<ExportPage> {
        export_ledger_scope(
            ledger,
            registry,
            partner_id,
            LEDGER_KIND,
            EXPORT_CONTRACT,
            continuation,
            page_size,
            retention_cutoff_ms,
            checkpoint_retention_cutoff_ms,
            previous_chain_hash,
            now_ms,
            signer,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt() -> Receipt {
        let payload = serde_json::json!({"amount": 100});
        Receipt {
            receipt_id: "rcpt_1".into(),
            partner_id: "p1".into(),
            signature: sign_receipt("rcpt_1", &payload),
            payload,
        }
    }

    fn known() -> (HashSet<String>, HashSet<String>) {
        let mut snapshots = HashSet::new();
        snapshots.insert("snap_1".to_string());
        let mut holdings = HashSet::new();
        holdings.insert("holding_1".to_string());
        (snapshots, holdings)
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let mut store = InclusionProofStore::default();
        let mut ledger = Ledger::new();
        let mut bad = receipt();
        bad.signature = "deadbeef".into();
        let (snapshots, holdings) = known();
        let err = store
            .record(
                &mut ledger,
                "link_1",
                &bad,
                &snapshots,
                &holdings,
                "snap_1",
                "holding_1",
                "pub_1",
                &["receipt:rcpt_1".into(), "custody_snapshot:snap_1".into()],
                "2025-01-01T00:00:00.000Z",
                1,
            )
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("inclusion_proof_receipt_signature_invalid"));
    }

    #[test]
    fn missing_artifact_refs_is_rejected() {
        let mut store = InclusionProofStore::default();
        let mut ledger = Ledger::new();
        let (snapshots, holdings) = known();
        let err = store
            .record(
                &mut ledger,
                "link_1",
                &receipt(),
                &snapshots,
                &holdings,
                "snap_1",
                "holding_1",
                "pub_1",
                &["receipt:rcpt_1".into()],
                "2025-01-01T00:00:00.000Z",
                1,
            )
            .unwrap_err();
        assert_eq!(
            err.reason_code(),
            Some("inclusion_proof_transparency_publication_missing_refs")
        );
    }

    #[test]
    fn chain_links_successive_linkages() {
        let mut store = InclusionProofStore::default();
        let mut ledger = Ledger::new();
        let (snapshots, holdings) = known();
        let refs = vec!["receipt:rcpt_1".to_string(), "custody_snapshot:snap_1".to_string()];
        let l1 = store
            .record(&mut ledger, "link_1", &receipt(), &snapshots, &holdings, "snap_1", "holding_1", "pub_1", &refs, "2025-01-01T00:00:00.000Z", 1)
            .unwrap();
        assert!(l1.previous_linkage_hash.is_none());

        let mut r2 = receipt();
        r2.receipt_id = "rcpt_2".into();
        r2.signature = sign_receipt("rcpt_2", &r2.payload);
        let refs2 = vec!["receipt:rcpt_2".to_string(), "custody_snapshot:snap_1".to_string()];
        let l2 = store
            .record(&mut ledger, "link_2", &r2, &snapshots, &holdings, "snap_1", "holding_1", "pub_2", &refs2, "2025-01-01T00:01:00.000Z", 60_000)
            .unwrap();
        assert_eq!(l2.previous_linkage_hash, Some(l1.linkage_hash));
    }

    #[test]
    fn export_returns_recorded_linkages_for_partner() {
        let mut store = InclusionProofStore::default();
        let mut ledger = Ledger::new();
        let (snapshots, holdings) = known();
        let refs = vec!["receipt:rcpt_1".to_string(), "custody_snapshot:snap_1".to_string()];
        store
            .record(&mut ledger, "link_1", &receipt(), &snapshots, &holdings, "snap_1", "holding_1", "pub_1", &refs, "2025-01-01T00:00:00.000Z", 1)
            .unwrap();

        let mut registry = CheckpointRegistry::new();
        let page = store
            .export(
                &ledger,
                &mut registry,
                "p1",
                &ContinuationRequest::default(),
                10,
                None,
                None,
                &crate::attestation::genesis(),
                1_000,
                &AttestationSigner::new("test-key", "test-secret"),
            )
            .unwrap();
        assert_eq!(page.entries.len(), 1);
    }
}
