//! Domain services (spec.md §4.11): delegations, liquidity (policy,
//! inventory, execution, governance), the matching rollout controller,
//! trust & safety, inclusion-proof linkage, the transparency log, staging
//! evidence, reliability remediation, cross-adapter compensation, the Steam
//! adapter contract, and read-only product projections.
//!
//! Every service composes the core machinery (`authz`, `idempotency`,
//! `ledger`, `export`, `dispatch`) rather than re-implementing it; see each
//! submodule's doc comment for its specific state-machine and the reason
//! codes it mints.

pub mod compensation;
pub mod delegation;
pub mod inclusion_proof;
pub mod liquidity;
pub mod matching;
pub mod products;
pub mod reliability;
pub mod staging_evidence;
pub mod steam_adapter;
pub mod transparency;
pub mod trust_safety;
