//! The single in-memory store (spec.md §5): all mutable state lives behind
//! one `parking_lot::Mutex`-guarded collection, written by a single logical
//! writer. CPU-bound work (matcher/shadow runs) may run in parallel via
//! `rayon`, but must never touch this state directly — it hands back a
//! result that the single writer then applies.

use crate::checkpoint::CheckpointRegistry;
use crate::clock::IdMinter;
use crate::domain::compensation::CompensationStore;
use crate::domain::delegation::DelegationStore;
use crate::domain::inclusion_proof::InclusionProofStore;
use crate::domain::liquidity::LiquidityProvider;
use crate::domain::liquidity::execution::ExecutionStore;
use crate::domain::liquidity::governance::GovernanceStore;
use crate::domain::liquidity::inventory::InventoryStore;
use crate::domain::liquidity::policy::LiquidityPolicyStore;
use crate::domain::matching::MatchingRolloutController;
use crate::domain::products::ProductsStore;
use crate::domain::reliability::ReliabilityStore;
use crate::domain::staging_evidence::StagingEvidenceStore;
use crate::domain::steam_adapter::SteamAdapterStore;
use crate::domain::transparency::TransparencyLogStore;
use crate::domain::trust_safety::TrustSafetyStore;
use crate::ledger::Ledger;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Everything mutated by a write operation. Held behind a single mutex so
/// that "single logical writer" is enforced structurally rather than by
/// convention: every write handler takes `store.lock()` once, does all of
/// its reads and writes against the guard, and releases it when the
/// function returns.
#[derive(Default)]
pub struct StoreState {
    pub delegations: DelegationStore,
    pub liquidity_providers: HashMap<String, LiquidityProvider>,
    pub liquidity_policy: LiquidityPolicyStore,
    pub inventory: InventoryStore,
    pub execution: ExecutionStore,
    pub governance: GovernanceStore,
    pub matching: MatchingRolloutController,
    pub trust_safety: TrustSafetyStore,
    pub inclusion_proof: InclusionProofStore,
    pub transparency: TransparencyLogStore,
    pub staging_evidence: StagingEvidenceStore,
    pub reliability: ReliabilityStore,
    pub compensation: CompensationStore,
    pub steam_adapter: SteamAdapterStore,
    pub products: ProductsStore,
    pub ledger: Ledger,
    pub chain_hashes: HashMap<(String, String), String>,
    pub checkpoints: CheckpointRegistry,
}

impl StoreState {
    pub fn chain_hash(&self, tenant_id: &str, kind: &str) -> String {
        self.chain_hashes
            .get(&(tenant_id.to_string(), kind.to_string()))
            .cloned()
            .unwrap_or_else(crate::attestation::genesis)
    }

    pub fn set_chain_hash(&mut self, tenant_id: &str, kind: &str, hash: String) {
        self.chain_hashes
            .insert((tenant_id.to_string(), kind.to_string()), hash);
    }
}

/// Process-wide handle: the mutex-guarded [`StoreState`] plus the ambient
/// services (id minting, idempotency registry) that every domain module
/// needs.
pub struct Store {
    pub state: Mutex<StoreState>,
    pub ids: IdMinter,
}

impl Store {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            ids: IdMinter::new(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_hash_defaults_to_genesis_for_unseen_scope() {
        let state = StoreState::default();
        assert_eq!(state.chain_hash("t1", "decision"), crate::attestation::genesis());
    }

    #[test]
    fn set_chain_hash_is_scoped_per_tenant_and_kind() {
        let mut state = StoreState::default();
        state.set_chain_hash("t1", "decision", "abc".to_string());
        assert_eq!(state.chain_hash("t1", "decision"), "abc");
        assert_eq!(state.chain_hash("t2", "decision"), crate::attestation::genesis());
    }
}
