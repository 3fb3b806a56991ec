//! Transparency log (spec.md §3, §4.11): a per-partner chain of
//! publications. `record` enforces chain continuity — the caller-claimed
//! `previous_root_hash` must equal the previous publication's `root_hash` —
//! and derives `chain_hash` deterministically as `H(curr_fields ||
//! prev.chain_hash)` (spec.md §8 invariant 8).

use crate::attestation::AttestationSigner;
use crate::canonical::{canonical_bytes, chain_hash, hex_sha256};
use crate::checkpoint::CheckpointRegistry;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const LEDGER_KIND: &str = "transparency_publication";
pub const EXPORT_CONTRACT: &str = "transparency_log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub publication_id: String,
    pub partner_id: String,
    pub root_hash: String,
    pub previous_root_hash: Option<String>,
    pub chain_hash: String,
    pub artifact_refs: Vec<String>,
    pub recorded_at: String,
}

#[derive(Default)]
pub struct TransparencyLogStore {
    pub chains: HashMap<String, Vec<Publication>>,
}

impl TransparencyLogStore {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        ledger: &mut Ledger,
        publication_id: &str,
        partner_id: &str,
        root_hash: &str,
        claimed_previous_root_hash: Option<&str>,
        artifact_refs: Vec<String>,
        now_iso: &str,
        now_ms: i64,
    ) -> CoreResult<Publication> {
        let chain = self.chains.entry(partner_id.to_string()).or_default();
        let previous = chain.last();

        match (previous, claimed_previous_root_hash) {
            (None, None) => {}
            (None, Some(_)) => {
                return Err(CoreError::constraint_violation(
                    "transparency_log_chain_discontinuity",
                ))
            }
            (Some(_), None) => {
                return Err(CoreError::constraint_violation(
                    "transparency_log_chain_discontinuity",
                ))
            }
            (Some(prev), Some(claimed)) if prev.root_hash != claimed => {
                return Err(CoreError::constraint_violation(
                    "transparency_log_chain_discontinuity",
                ))
            }
            _ => {}
        }

        let prev_chain_hash = previous.map(|p| p.chain_hash.clone()).unwrap_or_default();
        let fields = serde_json::json!({
            "publication_id": publication_id,
            "partner_id": partner_id,
            "root_hash": root_hash,
            "previous_root_hash": claimed_previous_root_hash,
            "artifact_refs": artifact_refs,
        });
        let fields_hash = hex_sha256(&canonical_bytes(&fields));
        let chain_hash_value = chain_hash(&[&fields_hash, &prev_chain_hash]);

        let publication = Publication {
            publication_id: publication_id.to_string(),
            partner_id: partner_id.to_string(),
            root_hash: root_hash.to_string(),
            previous_root_hash: claimed_previous_root_hash.map(str::to_string),
            chain_hash: chain_hash_value,
            artifact_refs,
            recorded_at: now_iso.to_string(),
        };
        chain.push(publication.clone());

        ledger.append(
            publication_id.to_string(),
            partner_id.to_string(),
            LEDGER_KIND,
            now_iso.to_string(),
            now_ms,
            serde_json::json!(publication),
        );
        Ok(publication)
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
