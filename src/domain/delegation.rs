//! Delegations (spec.md §3, §4.11): a user-issued grant to an agent/principal,
//! bounded by scopes and an expiry. `create` is idempotent at the business
//! level, independent of the call-level idempotency-key registry in
//! `dispatch.rs`: re-presenting the same `delegation_id` with identical
//! parameters is a no-op read of the existing record, while re-presenting it
//! with different parameters is a `CONFLICT`. `revoke` never moves
//! `revoked_at` once set. `list` is a SPEC_FULL addition — every other entity
//! family exposes an audit export, and delegations previously had only
//! create/get/revoke.

use crate::canonical::payload_hash_of;
use crate::dispatch::{Actor, ActorType};
use crate::error::{CoreError, CoreResult};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delegation {
    pub delegation_id: String,
    pub subject_actor: Actor,
    pub principal_agent: Actor,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub policy: Value,
    pub issued_at: String,
    pub expires_at: String,
    #[serde(default)]
    pub revoked_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDelegationRequest {
    pub delegation_id: String,
    pub principal_agent: Actor,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub policy: Value,
    pub expires_at: String,
}

#[derive(Default)]
pub struct DelegationStore {
    pub delegations: HashMap<String, Delegation>,
}

fn same_parameters(existing: &Delegation, actor: &Actor, req: &CreateDelegationRequest) -> bool {
    existing.subject_actor == *actor
        && existing.principal_agent == req.principal_agent
        && existing.scopes == req.scopes
        && existing.policy == req.policy
        && existing.expires_at == req.expires_at
}

impl DelegationStore {
    pub fn create(
        &mut self,
        ledger: &mut Ledger,
        actor: &Actor,
        req: &CreateDelegationRequest,
        now_iso: &str,
    ) -> CoreResult<Delegation> {
        if req.delegation_id.trim().is_empty() {
            return Err(CoreError::constraint_violation("delegation_id_empty"));
        }
        if req.scopes.is_empty() || req.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(CoreError::constraint_violation("delegation_scopes_invalid"));
        }
        crate::clock::parse_strict_iso8601(&req.expires_at)
            .map_err(|_| CoreError::constraint_violation("delegation_expires_at_invalid"))?;

        if let Some(existing) = self.delegations.get(&req.delegation_id) {
            return if same_parameters(existing, actor, req) {
                Ok(existing.clone())
            } else {
                Err(CoreError::conflict("delegation_conflicting_parameters"))
            };
        }

        let delegation = Delegation {
            delegation_id: req.delegation_id.clone(),
            subject_actor: actor.clone(),
            principal_agent: req.principal_agent.clone(),
            scopes: req.scopes.clone(),
            policy: req.policy.clone(),
            issued_at: now_iso.to_string(),
            expires_at: req.expires_at.clone(),
            revoked_at: None,
        };
        self.delegations
            .insert(req.delegation_id.clone(), delegation.clone());
        self.append_audit(ledger, &delegation, "created", now_iso);
        Ok(delegation)
    }

    pub fn get(&self, actor: &Actor, delegation_id: &str) -> CoreResult<Delegation> {
        let delegation = self
            .delegations
            .get(delegation_id)
            .ok_or_else(|| CoreError::not_found("delegation_not_found"))?;
        if delegation.subject_actor != *actor {
            return Err(CoreError::forbidden("delegation_actor_mismatch"));
        }
        Ok(delegation.clone())
    }

    pub fn revoke(
        &mut self,
        ledger: &mut Ledger,
        actor: &Actor,
        delegation_id: &str,
        now_iso: &str,
    ) -> CoreResult<Delegation> {
        let delegation = self
            .delegations
            .get_mut(delegation_id)
            .ok_or_else(|| CoreError::not_found("delegation_not_found"))?;
        if delegation.subject_actor != *actor {
            return Err(CoreError::forbidden("delegation_actor_mismatch"));
        }
        if delegation.revoked_at.is_none() {
            delegation.revoked_at = Some(now_iso.to_string());
            let snapshot = delegation.clone();
            self.append_audit(ledger, &snapshot, "revoked", now_iso);
            return Ok(snapshot);
        }
        Ok(delegation.clone())
    }

    fn append_audit(&self, ledger: &mut Ledger, delegation: &Delegation, event: &str, now_iso: &str) {
        let tenant = format!("{:?}:{}", delegation.subject_actor.actor_type, delegation.subject_actor.id);
        let ms = crate::clock::parse_strict_iso8601(now_iso)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_default();
        let id = format!(
            "{}:{}:{}",
            delegation.delegation_id,
            event,
            payload_hash_of(delegation).unwrap_or_default()
        );
        let payload = serde_json::json!({
            "event": event,
            "delegation": delegation,
        });
        ledger.append(id, tenant, "delegation", now_iso.to_string(), ms, payload);
    }

    pub fn tenant_key(actor: &Actor) -> String {
        format!("{:?}:{}", ActorType::User, actor.id)
    }

    /// List every delegation issued by `actor`, ordered by `delegation_id`.
    pub fn list(&self, actor: &Actor) -> Vec<Delegation> {
        let mut out: Vec<Delegation> = self
            .delegations
            .values()
            .filter(|d| d.subject_actor == *actor)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.delegation_id.cmp(&b.delegation_id));
        out
    }
}
