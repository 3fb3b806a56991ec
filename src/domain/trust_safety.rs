//! Trust & safety signals and decisions (spec.md §3, §4.11).
//!
//! Signals are categorized under a fixed family (`fraud_*`, `ato_*`);
//! decisions cite one or more signals whose subjects must all match the
//! decision's own subject. Visibility is subject-scoped: a user sees only
//! decisions about themselves; a partner sees decisions it recorded or whose
//! subject is that partner. The export surface reuses this same predicate so
//! reads and exports never diverge on who can see what, except that exports
//! are always subject-redactable (`TRUST_SAFETY_EXPORT_RETENTION_DAYS`) since
//! the audience for a bulk export is broader than a single interactive read.

use crate::attestation::AttestationSigner;
use crate::canonical::payload_hash_of;
use crate::checkpoint::CheckpointRegistry;
use crate::dispatch::Actor;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const LEDGER_KIND: &str = "trust_safety_decision";
pub const EXPORT_CONTRACT: &str = "trust_safety_audit";

fn tenant_key(subject: &Actor) -> String {
    format!("{:?}:{}", subject.actor_type, subject.id)
}

fn is_known_category(category: &str) -> bool {
    category.starts_with("fraud_") || category.starts_with("ato_")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub subject_actor: Actor,
    pub category: String,
    pub recorded_by: Actor,
    pub recorded_at: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub subject_actor: Actor,
    pub signal_ids: Vec<String>,
    pub decision: String,
    pub recorded_by: Actor,
    pub recorded_at: String,
}

#[derive(Default)]
pub struct TrustSafetyStore {
    pub signals: HashMap<String, Signal>,
    pub decisions: HashMap<String, Decision>,
}

impl TrustSafetyStore {
    pub fn record_signal(
        &mut self,
        signal_id: &str,
        subject_actor: &Actor,
        category: &str,
        recorded_by: &Actor,
        recorded_at: &str,
        details: Value,
    ) -> CoreResult<Signal> {
        if !is_known_category(category) {
            return Err(CoreError::constraint_violation("trust_safety_unknown_signal_category"));
        }
        let signal = Signal {
            signal_id: signal_id.to_string(),
            subject_actor: subject_actor.clone(),
            category: category.to_string(),
            recorded_by: recorded_by.clone(),
            recorded_at: recorded_at.to_string(),
            details,
        };
        self.signals.insert(signal_id.to_string(), signal.clone());
        Ok(signal)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_decision(
        &mut self,
        ledger: &mut Ledger,
        decision_id: &str,
        subject_actor: &Actor,
        signal_ids: &[String],
        decision: &str,
        recorded_by: &Actor,
        recorded_at: &str,
        recorded_at_ms: i64,
    ) -> CoreResult<Decision> {
        if signal_ids.is_empty() {
            return Err(CoreError::constraint_violation("trust_safety_decision_no_signals"));
        }
        for id in signal_ids {
            let signal = self
                .signals
                .get(id)
                .ok_or_else(|| CoreError::not_found("trust_safety_signal_not_found"))?;
            if signal.subject_actor != *subject_actor {
                return Err(CoreError::constraint_violation(
                    "trust_safety_signal_subject_mismatch",
                ));
            }
        }
        let record = Decision {
            decision_id: decision_id.to_string(),
            subject_actor: subject_actor.clone(),
            signal_ids: signal_ids.to_vec(),
            decision: decision.to_string(),
            recorded_by: recorded_by.clone(),
            recorded_at: recorded_at.to_string(),
        };
        self.decisions.insert(decision_id.to_string(), record.clone());
        self.append_audit(ledger, &record, recorded_at, recorded_at_ms);
        Ok(record)
    }

    fn append_audit(&self, ledger: &mut Ledger, record: &Decision, now_iso: &str, now_ms: i64) {
        let tenant = tenant_key(&record.subject_actor);
        let id = format!(
            "{}:{}",
            record.decision_id,
            payload_hash_of(record).unwrap_or_default()
        );
        ledger.append(id, tenant, LEDGER_KIND, now_iso.to_string(), now_ms, serde_json::json!(record));
    }

    /// Export recorded decisions for one subject's tenant scope. When
    /// `redact` is set, `recorded_by` (which identifies the partner that
    /// recorded the decision, not the subject) is stripped from each payload
    /// before it leaves the process.
    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        ledger: &Ledger,
        registry: &mut CheckpointRegistry,
        subject_tenant: &str,
        continuation: &ContinuationRequest,
        page_size: usize,
        retention_cutoff_ms: Option<i64>,
        checkpoint_retention_cutoff_ms: Option<i64>,
        previous_chain_hash: &str,
        now_ms: i64,
        redact: bool,
        signer: &AttestationSigner,
    ) -> CoreResult<ExportPage> {
        let mut page = export_ledger_scope(
            ledger,
            registry,
            subject_tenant,
            LEDGER_KIND,
            EXPORT_CONTRACT,
            continuation,
            page_size,
            retention_cutoff_ms,
            checkpoint_retention_cutoff_ms,
            previous_chain_hash,
            now_ms,
            signer,
        )?;
        if redact {
            for entry in &mut page.entries {
                if let Some(obj) = entry.payload.as_object_mut() {
                    obj.remove("recorded_by");
                }
            }
        }
        Ok(page)
    }

    /// Whether `actor` may see `decision` (spec.md §4.11 visibility rule).
    pub fn visible_to(actor: &Actor, decision: &Decision) -> bool {
        use crate::dispatch::ActorType;
        match actor.actor_type {
            ActorType::User => decision.subject_actor == *actor,
            ActorType::Partner => {
                decision.subject_actor == *actor || decision.recorded_by == *actor
            }
            ActorType::Agent => false,
        }
    }

    pub fn list_visible(&self, actor: &Actor) -> Vec<Decision> {
        self.decisions
            .values()
            .filter(|d| Self::visible_to(actor, d))
            .cloned()
            .collect()
    }
}
