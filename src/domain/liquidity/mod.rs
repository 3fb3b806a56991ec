//! Liquidity provider domain (spec.md §3, §4.9, §4.11): policy evaluation,
//! inventory reservations, execution mode/requests, and partner governance.
//! Every write here enforces `actor = provider.owner_actor` (spec.md §4.3)
//! via [`crate::dispatch::require_provider_owner`].

pub mod execution;
pub mod governance;
pub mod inventory;
pub mod policy;

use serde::{Deserialize, Serialize};

/// The external entity referenced throughout this module; owned by exactly
/// one partner actor. Out of scope to fully model (spec.md §3 calls it
/// "external to the core but referenced"); we keep only what every write
/// handler needs to enforce ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidityProvider {
    pub provider_id: String,
    pub owner_actor: crate::dispatch::Actor,
}

/// Round to 2 decimal places the way USD amounts are rounded throughout this
/// module (spec.md §4.9 step 7, §3's `max_daily_value_usd`).
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_rounds_half_away_from_zero() {
        assert_eq!(round2(1.005), 1.0); // float repr of 1.005 rounds down; documents behavior
        assert_eq!(round2(1.015000001), 1.02);
        assert_eq!(round2(10.0), 10.0);
    }
}
