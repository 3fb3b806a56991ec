//! Execution mode and execution-request approvals (spec.md §3).
//!
//! `constrained_auto` mode in a restricted adapter context additionally
//! requires an approved, non-expired override and the platform
//! `INTEGRATION_ENABLED` gate. Execution requests are `pending -> {approved,
//! rejected}`, terminal; re-deciding with the identical decision payload is
//! idempotent, a different payload is a `CONFLICT`. A request recorded with
//! `auto_execute = true` or `platform_policy_blocked = true` is rejected
//! outright — those are platform invariants this module enforces, not
//! outcomes an operator can override.

use super::policy::PolicyMode;
use crate::attestation::AttestationSigner;
use crate::checkpoint::CheckpointRegistry;
use crate::dispatch::Actor;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const LEDGER_KIND: &str = "liquidity_execution_request";
pub const EXPORT_CONTRACT: &str = "liquidity_execution";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverridePolicy {
    pub approved: bool,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionModeRecord {
    pub provider_id: String,
    pub mode: PolicyMode,
    pub restricted_adapter_context: bool,
    #[serde(default)]
    pub override_policy: Option<OverridePolicy>,
    pub updated_at: String,
    pub updated_by: Actor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub status: RequestStatus,
    pub action_type: String,
    pub risk_class: String,
    pub reason_codes: Vec<String>,
    pub mode_snapshot: ExecutionModeRecord,
    #[serde(default)]
    pub decision_correlation_id: Option<String>,
    #[serde(default)]
    pub operator_actor: Option<Actor>,
    #[serde(default)]
    pub decided_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub status: RequestStatus,
    pub decision_correlation_id: Option<String>,
    pub operator_actor: Option<Actor>,
    pub decided_at: Option<String>,
}

#[derive(Default)]
pub struct ExecutionStore {
    pub modes: HashMap<String, ExecutionModeRecord>,
    pub requests: HashMap<String, ExecutionRequest>,
}

impl ExecutionStore {
    pub fn set_mode(
        &mut self,
        provider_id: &str,
        mode: PolicyMode,
        restricted_adapter_context: bool,
        override_policy: Option<OverridePolicy>,
        updated_by: &Actor,
        now_iso: &str,
        integration_enabled: bool,
    ) -> CoreResult<ExecutionModeRecord> {
        if mode == PolicyMode::ConstrainedAuto && restricted_adapter_context {
            let Some(ref ov) = override_policy else {
                return Err(CoreError::constraint_violation(
                    "liquidity_execution_restricted_context_requires_override",
                ));
            };
            if !ov.approved {
                return Err(CoreError::constraint_violation(
                    "liquidity_execution_override_not_approved",
                ));
            }
            let expires = crate::clock::parse_strict_iso8601(&ov.expires_at)
                .map_err(|_| CoreError::constraint_violation("liquidity_execution_override_expiry_invalid"))?;
            let now = crate::clock::parse_strict_iso8601(now_iso)
                .map_err(|_| CoreError::constraint_violation("liquidity_execution_now_iso_invalid"))?;
            if expires <= now {
                return Err(CoreError::constraint_violation(
                    "liquidity_execution_override_expired",
                ));
            }
            if !integration_enabled {
                return Err(CoreError::constraint_violation(
                    "liquidity_execution_integration_disabled",
                ));
            }
        }
        let record = ExecutionModeRecord {
            provider_id: provider_id.to_string(),
            mode,
            restricted_adapter_context,
            override_policy,
            updated_at: now_iso.to_string(),
            updated_by: updated_by.clone(),
        };
        self.modes.insert(provider_id.to_string(), record.clone());
        Ok(record)
    }

    pub fn get_mode(&self, provider_id: &str) -> CoreResult<ExecutionModeRecord> {
        self.modes
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("liquidity_execution_mode_not_found"))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_request(
        &mut self,
        request_id: &str,
        action_type: &str,
        risk_class: &str,
        reason_codes: Vec<String>,
        mode_snapshot: ExecutionModeRecord,
        auto_execute: bool,
        platform_policy_blocked: bool,
    ) -> CoreResult<ExecutionRequest> {
        if auto_execute {
            return Err(CoreError::conflict("liquidity_execution_auto_execute_blocked"));
        }
        if platform_policy_blocked {
            return Err(CoreError::conflict("liquidity_execution_platform_policy_blocked"));
        }
        if self.requests.contains_key(request_id) {
            return Err(CoreError::conflict("liquidity_execution_duplicate_request_id"));
        }
        let request = ExecutionRequest {
            request_id: request_id.to_string(),
            status: RequestStatus::Pending,
            action_type: action_type.to_string(),
            risk_class: risk_class.to_string(),
            reason_codes,
            mode_snapshot,
            decision_correlation_id: None,
            operator_actor: None,
            decided_at: None,
        };
        self.requests.insert(request_id.to_string(), request.clone());
        Ok(request)
    }

    pub fn decide(
        &mut self,
        ledger: &mut Ledger,
        request_id: &str,
        decision: &Decision,
        now_iso: &str,
        now_ms: i64,
    ) -> CoreResult<ExecutionRequest> {
        if decision.status == RequestStatus::Pending {
            return Err(CoreError::constraint_violation(
                "liquidity_execution_decision_must_be_terminal",
            ));
        }
        let request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| CoreError::not_found("liquidity_execution_request_not_found"))?;

        let already_decided = |r: &ExecutionRequest| Decision {
            status: r.status,
            decision_correlation_id: r.decision_correlation_id.clone(),
            operator_actor: r.operator_actor.clone(),
            decided_at: r.decided_at.clone(),
        };

        let was_pending = request.status == RequestStatus::Pending;
        let result = match request.status {
            RequestStatus::Pending => {
                request.status = decision.status;
                request.decision_correlation_id = decision.decision_correlation_id.clone();
                request.operator_actor = decision.operator_actor.clone();
                request.decided_at = decision.decided_at.clone();
                Ok(request.clone())
            }
            _ if already_decided(request) == *decision => Ok(request.clone()),
            _ => Err(CoreError::conflict("liquidity_execution_decision_conflict")),
        };

        if was_pending {
            if let Ok(ref decided) = result {
                let provider_id = decided.mode_snapshot.provider_id.clone();
                let id = format!("{request_id}:{:?}", decided.status);
                ledger.append(id, provider_id, LEDGER_KIND, now_iso.to_string(), now_ms, serde_json::json!(decided));
            }
        }
        result
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

    fn actor(id: &str) -> Actor {
        Actor::new(crate::dispatch::ActorType::Partner, id)
    }

    fn mode_record() -> ExecutionModeRecord {
        ExecutionModeRecord {
            provider_id: "lp1".into(),
            mode: PolicyMode::Manual,
            restricted_adapter_context: false,
            override_policy: None,
            updated_at: "2025-01-01T00:00:00.000Z".into(),
            updated_by: actor("p1"),
        }
    }

    #[test]
    fn constrained_auto_in_restricted_context_requires_override() {
        let mut store = ExecutionStore::default();
        let err = store
            .set_mode(
                "lp1",
                PolicyMode::ConstrainedAuto,
                true,
                None,
                &actor("p1"),
                "2025-01-01T00:00:00.000Z",
                true,
            )
            .unwrap_err();
        assert_eq!(
            err.reason_code(),
            Some("liquidity_execution_restricted_context_requires_override")
        );
    }

    #[test]
    fn constrained_auto_requires_integration_enabled_flag() {
        let mut store = ExecutionStore::default();
        let ov = OverridePolicy {
            approved: true,
            expires_at: "2099-01-01T00:00:00Z".into(),
        };
        let err = store
            .set_mode(
                "lp1",
                PolicyMode::ConstrainedAuto,
                true,
                Some(ov),
                &actor("p1"),
                "2025-01-01T00:00:00.000Z",
                false,
            )
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("liquidity_execution_integration_disabled"));
    }

    #[test]
    fn expired_override_is_rejected() {
        let mut store = ExecutionStore::default();
        let ov = OverridePolicy {
            approved: true,
            expires_at: "2020-01-01T00:00:00Z".into(),
        };
        let err = store
            .set_mode(
                "lp1",
                PolicyMode::ConstrainedAuto,
                true,
                Some(ov),
                &actor("p1"),
                "2025-01-01T00:00:00.000Z",
                true,
            )
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("liquidity_execution_override_expired"));
    }

    #[test]
    fn auto_execute_true_is_always_rejected() {
        let mut store = ExecutionStore::default();
        let err = store
            .record_request("req_1", "execute", "low", vec![], mode_record(), true, false)
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("liquidity_execution_auto_execute_blocked"));
    }

    #[test]
    fn decide_is_idempotent_for_identical_decision_and_conflicts_otherwise() {
        let mut store = ExecutionStore::default();
        let mut ledger = Ledger::new();
        store
            .record_request("req_1", "execute", "low", vec![], mode_record(), false, false)
            .unwrap();
        let decision = Decision {
            status: RequestStatus::Approved,
            decision_correlation_id: Some("corr_1".into()),
            operator_actor: Some(actor("p1")),
            decided_at: Some("2025-01-01T00:00:00.000Z".into()),
        };
        let r1 = store
            .decide(&mut ledger, "req_1", &decision, "2025-01-01T00:00:00.000Z", 1)
            .unwrap();
        assert_eq!(r1.status, RequestStatus::Approved);
        let r2 = store
            .decide(&mut ledger, "req_1", &decision, "2025-01-01T00:00:00.000Z", 1)
            .unwrap();
        assert_eq!(r2.status, RequestStatus::Approved);
        assert_eq!(ledger.scope("lp1", LEDGER_KIND).len(), 1);

        let mut other = decision.clone();
        other.decision_correlation_id = Some("corr_2".into());
        let err = store
            .decide(&mut ledger, "req_1", &other, "2025-01-01T00:00:00.000Z", 1)
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("liquidity_execution_decision_conflict"));
    }

    #[test]
    fn export_returns_the_recorded_decision() {
        let mut store = ExecutionStore::default();
        let mut ledger = Ledger::new();
        store
            .record_request("req_1", "execute", "low", vec![], mode_record(), false, false)
            .unwrap();
        let decision = Decision {
            status: RequestStatus::Approved,
            decision_correlation_id: Some("corr_1".into()),
            operator_actor: Some(actor("p1")),
            decided_at: Some("2025-01-01T00:00:00.000Z".into()),
        };
        store
            .decide(&mut ledger, "req_1", &decision, "2025-01-01T00:00:00.000Z", 1)
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
