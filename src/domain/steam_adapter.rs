//! Steam adapter contract and preflight (spec.md §3, §4.11).
//!
//! `upsert` stores a versioned per-partner contract, bumping the version on
//! every write. `preflight` validates a prospective settlement batch against
//! the currently stored contract and fails with a specific reason code per
//! violated clause, never a generic one.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderContract {
    pub partner_id: String,
    pub version: u64,
    pub supported_settlement_modes: Vec<String>,
    pub dry_run_required: bool,
    pub max_batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightResult {
    pub partner_id: String,
    pub contract_version: u64,
    pub settlement_mode: String,
    pub batch_size: u32,
}

#[derive(Default)]
pub struct SteamAdapterStore {
    pub contracts: HashMap<String, ProviderContract>,
}

impl SteamAdapterStore {
    pub fn upsert(
        &mut self,
        partner_id: &str,
        supported_settlement_modes: Vec<String>,
        dry_run_required: bool,
        max_batch_size: u32,
    ) -> ProviderContract {
        let version = self
            .contracts
            .get(partner_id)
            .map(|c| c.version + 1)
            .unwrap_or(1);
        let contract = ProviderContract {
            partner_id: partner_id.to_string(),
            version,
            supported_settlement_modes,
            dry_run_required,
            max_batch_size,
        };
        self.contracts.insert(partner_id.to_string(), contract.clone());
        contract
    }

    pub fn get(&self, partner_id: &str) -> CoreResult<ProviderContract> {
        self.contracts
            .get(partner_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("steam_adapter_contract_not_found"))
    }

    pub fn preflight(
        &self,
        partner_id: &str,
        settlement_mode: &str,
        dry_run: bool,
        batch_size: u32,
    ) -> CoreResult<PreflightResult> {
        let contract = self.get(partner_id)?;

        if !contract
            .supported_settlement_modes
            .iter()
            .any(|m| m == settlement_mode)
        {
            return Err(CoreError::constraint_violation(
                "steam_adapter_unsupported_settlement_mode",
            ));
        }
        if contract.dry_run_required && !dry_run {
            return Err(CoreError::constraint_violation(
                "steam_adapter_dry_run_required",
            ));
        }
        if batch_size > contract.max_batch_size {
            return Err(CoreError::constraint_violation(
                "steam_adapter_batch_size_exceeded",
            ));
        }

        Ok(PreflightResult {
            partner_id: partner_id.to_string(),
            contract_version: contract.version,
            settlement_mode: settlement_mode.to_string(),
            batch_size,
        })
    }
}
