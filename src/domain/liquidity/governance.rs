//! Partner liquidity-provider governance (spec.md §3): segment tier,
//! lifecycle status, and rollout activation. Rollout activation requires a
//! prior eligibility evaluation with `verdict = allow` and zero unresolved
//! critical violations, and the target segment tier may advance by at most
//! one step from the current tier.

use crate::attestation::AttestationSigner;
use crate::checkpoint::CheckpointRegistry;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const LEDGER_KIND: &str = "partner_liquidity_provider_rollout";
pub const EXPORT_CONTRACT: &str = "partner_liquidity_provider_rollout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentTier {
    S0,
    S1,
    S2,
    S3,
}

impl SegmentTier {
    fn index(self) -> u8 {
        match self {
            SegmentTier::S0 => 0,
            SegmentTier::S1 => 1,
            SegmentTier::S2 => 2,
            SegmentTier::S3 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceStatus {
    PendingReview,
    Active,
    Restricted,
    Offboarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityVerdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eligibility {
    pub verdict: EligibilityVerdict,
    pub unresolved_critical_violations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceRecord {
    pub provider_id: String,
    pub segment_tier: SegmentTier,
    pub status: GovernanceStatus,
    pub rollout_policy_version: u64,
    #[serde(default)]
    pub last_eligibility: Option<Eligibility>,
}

#[derive(Default)]
pub struct GovernanceStore {
    pub records: HashMap<String, GovernanceRecord>,
}

impl GovernanceStore {
    pub fn get_or_init(&mut self, provider_id: &str) -> GovernanceRecord {
        self.records
            .entry(provider_id.to_string())
            .or_insert_with(|| GovernanceRecord {
                provider_id: provider_id.to_string(),
                segment_tier: SegmentTier::S0,
                status: GovernanceStatus::PendingReview,
                rollout_policy_version: 1,
                last_eligibility: None,
            })
            .clone()
    }

    pub fn record_eligibility(&mut self, provider_id: &str, eligibility: Eligibility) -> GovernanceRecord {
        let mut record = self.get_or_init(provider_id);
        record.last_eligibility = Some(eligibility);
        self.records.insert(provider_id.to_string(), record.clone());
        record
    }

    pub fn activate_rollout(
        &mut self,
        ledger: &mut Ledger,
        provider_id: &str,
        target_segment_tier: SegmentTier,
        now_iso: &str,
        now_ms: i64,
    ) -> CoreResult<GovernanceRecord> {
        let mut record = self.get_or_init(provider_id);

        let eligible = record
            .last_eligibility
            .as_ref()
            .map(|e| e.verdict == EligibilityVerdict::Allow && e.unresolved_critical_violations == 0)
            .unwrap_or(false);
        if !eligible {
            return Err(CoreError::constraint_violation(
                "partner_liquidity_provider_rollout_requires_eligible_verdict",
            ));
        }
        if target_segment_tier.index() > record.segment_tier.index() + 1 {
            return Err(CoreError::constraint_violation(
                "partner_liquidity_provider_rollout_tier_jump_too_large",
            ));
        }

        record.segment_tier = target_segment_tier;
        record.status = GovernanceStatus::Active;
        record.rollout_policy_version += 1;
        self.records.insert(provider_id.to_string(), record.clone());

        let id = format!("{provider_id}:v{}", record.rollout_policy_version);
        ledger.append(id, provider_id.to_string(), LEDGER_KIND, now_iso.to_string(), now_ms, serde_json::json!(record));
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        ledger: &Ledger,
        registry: &mut CheckpointRegistry,
        provider_id: &str,
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
            provider_id,
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

    #[test]
    fn rollout_blocked_without_prior_eligibility() {
        let mut store = GovernanceStore::default();
        let mut ledger = Ledger::new();
        let err = store
            .activate_rollout(&mut ledger, "lp1", SegmentTier::S1, "2025-01-01T00:00:00.000Z", 1)
            .unwrap_err();
        assert_eq!(
            err.reason_code(),
            Some("partner_liquidity_provider_rollout_requires_eligible_verdict")
        );
    }

    #[test]
    fn rollout_blocked_with_unresolved_critical_violations() {
        let mut store = GovernanceStore::default();
        let mut ledger = Ledger::new();
        store.record_eligibility(
            "lp1",
            Eligibility {
                verdict: EligibilityVerdict::Allow,
                unresolved_critical_violations: 1,
            },
        );
        let err = store
            .activate_rollout(&mut ledger, "lp1", SegmentTier::S1, "2025-01-01T00:00:00.000Z", 1)
            .unwrap_err();
        assert_eq!(
            err.reason_code(),
            Some("partner_liquidity_provider_rollout_requires_eligible_verdict")
        );
    }

    #[test]
    fn rollout_cannot_skip_more_than_one_tier() {
        let mut store = GovernanceStore::default();
        let mut ledger = Ledger::new();
        store.record_eligibility(
            "lp1",
            Eligibility {
                verdict: EligibilityVerdict::Allow,
                unresolved_critical_violations: 0,
            },
        );
        let err = store
            .activate_rollout(&mut ledger, "lp1", SegmentTier::S2, "2025-01-01T00:00:00.000Z", 1)
            .unwrap_err();
        assert_eq!(
            err.reason_code(),
            Some("partner_liquidity_provider_rollout_tier_jump_too_large")
        );
    }

    #[test]
    fn eligible_single_step_rollout_succeeds() {
        let mut store = GovernanceStore::default();
        let mut ledger = Ledger::new();
        store.record_eligibility(
            "lp1",
            Eligibility {
                verdict: EligibilityVerdict::Allow,
                unresolved_critical_violations: 0,
            },
        );
        let record = store
            .activate_rollout(&mut ledger, "lp1", SegmentTier::S1, "2025-01-01T00:00:00.000Z", 1)
            .unwrap();
        assert_eq!(record.segment_tier, SegmentTier::S1);
        assert_eq!(record.status, GovernanceStatus::Active);
    }

    #[test]
    fn export_returns_the_rollout_audit_entry() {
        let mut store = GovernanceStore::default();
        let mut ledger = Ledger::new();
        store.record_eligibility(
            "lp1",
            Eligibility {
                verdict: EligibilityVerdict::Allow,
                unresolved_critical_violations: 0,
            },
        );
        store
            .activate_rollout(&mut ledger, "lp1", SegmentTier::S1, "2025-01-01T00:00:00.000Z", 1)
            .unwrap();

        let mut registry = CheckpointRegistry::new();
        let page = store
            .export(
                &ledger,
                &mut registry,
                "lp1",
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
