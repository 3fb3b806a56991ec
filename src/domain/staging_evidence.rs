//! Staging evidence bundles (spec.md §3, §4.11): per-partner milestone
//! evidence uploads that chain a `checkpoint_hash` from the previous bundle's
//! `checkpoint_hash`, with duplicate-(partner, milestone, manifest_hash)
//! rejection and pagination continuation pinned to that chain.

use crate::attestation::AttestationSigner;
use crate::canonical::{canonical_bytes, hex_sha256};
use crate::checkpoint::CheckpointRegistry;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const LEDGER_KIND: &str = "staging_evidence_bundle";
pub const EXPORT_CONTRACT: &str = "staging_evidence";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingEvidenceBundle {
    pub bundle_id: String,
    pub partner_id: String,
    pub milestone: String,
    pub manifest_hash: String,
    pub manifest: Value,
    pub previous_checkpoint_hash: Option<String>,
    pub checkpoint_hash: String,
    pub recorded_at: String,
}

#[derive(Default)]
pub struct StagingEvidenceStore {
    chains: HashMap<String, Vec<StagingEvidenceBundle>>,
}

impl StagingEvidenceStore {
    fn last(&self, partner_id: &str) -> Option<&StagingEvidenceBundle> {
        self.chains.get(partner_id).and_then(|c| c.last())
    }

    /// Continuation cursors carry the `checkpoint_hash` of the bundle they
    /// were issued after; a submission must match the chain's current tip or
    /// be rejected as stale.
    pub fn verify_continuation_anchor(&self, partner_id: &str, anchor: &str) -> bool {
        match self.last(partner_id) {
            None => anchor.is_empty(),
            Some(last) => last.checkpoint_hash == anchor,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &mut self,
        ledger: &mut Ledger,
        bundle_id: &str,
        partner_id: &str,
        milestone: &str,
        manifest: Value,
        now_iso: &str,
        now_ms: i64,
    ) -> CoreResult<StagingEvidenceBundle> {
        let manifest_hash = hex_sha256(&canonical_bytes(&manifest));

        if let Some(chain) = self.chains.get(partner_id) {
            if chain
                .iter()
                .any(|b| b.milestone == milestone && b.manifest_hash == manifest_hash)
            {
                return Err(CoreError::conflict("staging_evidence_duplicate_bundle"));
            }
        }

        let previous_checkpoint_hash = self.last(partner_id).map(|b| b.checkpoint_hash.clone());
        let fields = serde_json::json!({
            "bundle_id": bundle_id,
            "partner_id": partner_id,
            "milestone": milestone,
            "manifest_hash": manifest_hash,
        });
        let fields_hash = hex_sha256(&canonical_bytes(&fields));
        let checkpoint_hash = hex_sha256(
            format!(
                "{}|{}",
                previous_checkpoint_hash.as_deref().unwrap_or(""),
                fields_hash
            )
            .as_bytes(),
        );

        let bundle = StagingEvidenceBundle {
            bundle_id: bundle_id.to_string(),
            partner_id: partner_id.to_string(),
            milestone: milestone.to_string(),
            manifest_hash,
            manifest,
            previous_checkpoint_hash,
            checkpoint_hash,
            recorded_at: now_iso.to_string(),
        };
        self.chains.entry(partner_id.to_string()).or_default().push(bundle.clone());
        ledger.append(
            bundle_id.to_string(),
            partner_id.to_string(),
            LEDGER_KIND,
            now_iso.to_string(),
            now_ms,
            serde_json::json!(bundle),
        );
        Ok(bundle)
    }

    pub fn list(&self, partner_id: &str) -> Vec<StagingEvidenceBundle> {
        self.chains.get(partner_id).cloned().unwrap_or_default()
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
