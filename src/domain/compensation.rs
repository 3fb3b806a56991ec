//! Cross-adapter compensation cases (spec.md §3, §4.11).
//!
//! Opening a case requires a signed cross-adapter receipt whose
//! `compensation_required` flag is true. The case then follows a fixed DAG:
//! `open -> {approved, rejected} -> resolved` (resolved only reachable from
//! `approved`); any other transition is a `CONSTRAINT_VIOLATION`.

use crate::canonical::{canonical_bytes, hex_sha256};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossAdapterReceipt {
    pub receipt_id: String,
    pub compensation_required: bool,
    pub payload: Value,
    pub signature: String,
}

/// Deterministic "signature": `H(canonical(payload) || receipt_id)`, the
/// same stand-in scheme used for inclusion-proof receipts.
pub fn sign_receipt(receipt_id: &str, payload: &Value) -> String {
    let mut bytes = canonical_bytes(payload);
    bytes.extend_from_slice(receipt_id.as_bytes());
    hex_sha256(&bytes)
}

pub fn verify_receipt(receipt: &CrossAdapterReceipt) -> bool {
    receipt.signature == sign_receipt(&receipt.receipt_id, &receipt.payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Open,
    Approved,
    Rejected,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationCase {
    pub case_id: String,
    pub receipt_id: String,
    pub status: CaseStatus,
    pub opened_at: String,
    #[serde(default)]
    pub decided_at: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
}

#[derive(Default)]
pub struct CompensationStore {
    pub cases: HashMap<String, CompensationCase>,
}

impl CompensationStore {
    pub fn create(
        &mut self,
        case_id: &str,
        receipt: &CrossAdapterReceipt,
        now_iso: &str,
    ) -> CoreResult<CompensationCase> {
        if !receipt.compensation_required {
            return Err(CoreError::constraint_violation(
                "compensation_receipt_not_required",
            ));
        }
        if !verify_receipt(receipt) {
            return Err(CoreError::constraint_violation(
                "compensation_receipt_signature_invalid",
            ));
        }
        if self.cases.contains_key(case_id) {
            return Err(CoreError::conflict("compensation_case_duplicate_id"));
        }
        let case = CompensationCase {
            case_id: case_id.to_string(),
            receipt_id: receipt.receipt_id.clone(),
            status: CaseStatus::Open,
            opened_at: now_iso.to_string(),
            decided_at: None,
            resolved_at: None,
        };
        self.cases.insert(case_id.to_string(), case.clone());
        Ok(case)
    }

    pub fn transition(
        &mut self,
        case_id: &str,
        target: CaseStatus,
        now_iso: &str,
    ) -> CoreResult<CompensationCase> {
        let case = self
            .cases
            .get_mut(case_id)
            .ok_or_else(|| CoreError::not_found("compensation_case_not_found"))?;

        let allowed = matches!(
            (case.status, target),
            (CaseStatus::Open, CaseStatus::Approved)
                | (CaseStatus::Open, CaseStatus::Rejected)
                | (CaseStatus::Approved, CaseStatus::Resolved)
        );
        if !allowed {
            return Err(CoreError::constraint_violation(
                "compensation_case_invalid_transition",
            ));
        }

        case.status = target;
        match target {
            CaseStatus::Approved | CaseStatus::Rejected => case.decided_at = Some(now_iso.to_string()),
            CaseStatus::Resolved => case.resolved_at = Some(now_iso.to_string()),
            CaseStatus::Open => unreachable!(),
        }
        Ok(case.clone())
    }

    pub fn get(&self, case_id: &str) -> CoreResult<CompensationCase> {
        self.cases
            .get(case_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("compensation_case_not_found"))
    }
}
