//! Liquidity policy and the policy evaluator (spec.md §4.9).
//!
//! The evaluator is deterministic and total: every failed predicate appends
//! a reason code, duplicates suppressed and the final list lexicographically
//! sorted for chaining stability (spec.md §3), and the verdict is `deny` iff
//! the reason-code set is non-empty. On `allow`, the
//! per-provider daily and counterparty exposure accumulators advance for the
//! evaluated day bucket; either verdict appends an immutable audit entry.

use super::round2;
use crate::attestation::AttestationSigner;
use crate::checkpoint::CheckpointRegistry;
use crate::error::{CoreError, CoreResult};
use crate::export::{export_ledger_scope, ContinuationRequest, ExportPage};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CANONICAL_PRECEDENCE: &str = "safety>trust>lp_autonomy_policy>commercial>preference";

/// Ledger kind for recorded evaluations (spec.md §4.9 step 9); also the
/// export contract name, matching `LIQUIDITY_POLICY_AUDIT_EXPORT_*` (spec.md
/// §6).
pub const LEDGER_KIND: &str = "liquidity_policy_audit";
pub const EXPORT_CONTRACT: &str = "liquidity_policy_audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighVolatilityMode {
    Tighten,
    Pause,
    QuoteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Simulation,
    OperatorAssisted,
    ConstrainedAuto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Quote,
    Accept,
    Execute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPolicy {
    pub provider_id: String,
    pub version: u64,
    pub max_spread_bps: u32,
    pub max_daily_value_usd: f64,
    pub max_counterparty_exposure_usd: f64,
    pub min_price_confidence_bps: u32,
    pub blocked_asset_liquidity_tiers: Vec<String>,
    pub high_volatility_mode: HighVolatilityMode,
    pub policy_mode: PolicyMode,
}

const VALID_TIERS: &[&str] = &["low", "medium", "high", "critical"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertPolicyRequest {
    pub max_spread_bps: u32,
    pub max_daily_value_usd: f64,
    pub max_counterparty_exposure_usd: f64,
    pub min_price_confidence_bps: u32,
    #[serde(default)]
    pub blocked_asset_liquidity_tiers: Vec<String>,
    pub high_volatility_mode: HighVolatilityMode,
    pub policy_mode: PolicyMode,
}

fn normalize_tiers(tiers: &[String]) -> CoreResult<Vec<String>> {
    for t in tiers {
        if !VALID_TIERS.contains(&t.as_str()) {
            return Err(CoreError::constraint_violation(
                "liquidity_policy_invalid_asset_tier",
            ));
        }
    }
    let mut out: Vec<String> = tiers.to_vec();
    out.sort();
    out.dedup();
    Ok(out)
}

#[derive(Default)]
pub struct LiquidityPolicyStore {
    pub policies: HashMap<String, LiquidityPolicy>,
    daily_accumulator: HashMap<(String, String), f64>,
    counterparty_accumulator: HashMap<(String, String), f64>,
}

impl LiquidityPolicyStore {
    pub fn upsert(
        &mut self,
        provider_id: &str,
        req: &UpsertPolicyRequest,
    ) -> CoreResult<LiquidityPolicy> {
        if req.max_spread_bps > 10_000 || req.min_price_confidence_bps > 10_000 {
            return Err(CoreError::constraint_violation(
                "liquidity_policy_bps_out_of_range",
            ));
        }
        if req.max_daily_value_usd < 0.0 || req.max_counterparty_exposure_usd < 0.0 {
            return Err(CoreError::constraint_violation(
                "liquidity_policy_negative_value",
            ));
        }
        let tiers = normalize_tiers(&req.blocked_asset_liquidity_tiers)?;
        let next_version = self
            .policies
            .get(provider_id)
            .map(|p| p.version + 1)
            .unwrap_or(1);
        let policy = LiquidityPolicy {
            provider_id: provider_id.to_string(),
            version: next_version,
            max_spread_bps: req.max_spread_bps,
            max_daily_value_usd: round2(req.max_daily_value_usd),
            max_counterparty_exposure_usd: round2(req.max_counterparty_exposure_usd),
            min_price_confidence_bps: req.min_price_confidence_bps,
            blocked_asset_liquidity_tiers: tiers,
            high_volatility_mode: req.high_volatility_mode,
            policy_mode: req.policy_mode,
        };
        self.policies.insert(provider_id.to_string(), policy.clone());
        Ok(policy)
    }

    pub fn get(&self, provider_id: &str) -> CoreResult<LiquidityPolicy> {
        self.policies
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("liquidity_policy_not_found"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationInput {
    pub precedence_assertion: String,
    pub safety_gate_passed: bool,
    pub trust_gate_passed: bool,
    pub commercial_gate_passed: bool,
    pub action_type: ActionType,
    pub spread_bps: u32,
    pub quote_value_usd: f64,
    pub daily_value_usd: f64,
    pub counterparty_actor_id: String,
    pub counterparty_exposure_usd: f64,
    pub price_confidence_bps: u32,
    pub asset_liquidity_tier: String,
    pub high_volatility: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    pub reason_codes: Vec<String>,
    pub effective_max_spread_bps: u32,
    pub projected_daily_value_usd: f64,
    pub projected_counterparty_exposure_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

struct ReasonCodes {
    seen: Vec<String>,
}

impl ReasonCodes {
    fn new() -> Self {
        Self { seen: Vec::new() }
    }
    fn push(&mut self, code: &str) {
        if !self.seen.iter().any(|c| c == code) {
            self.seen.push(code.to_string());
        }
    }
}

/// Evaluate one request against a policy version (spec.md §4.9), against a
/// fresh (zeroed) exposure accumulator. Does not mutate accumulators or
/// append audit entries — callers that actually record an evaluation should
/// go through [`LiquidityPolicyStore::record_evaluation`].
pub fn evaluate(policy: &LiquidityPolicy, input: &EvaluationInput) -> CoreResult<EvaluationResult> {
    evaluate_with_accumulators(policy, 0.0, 0.0, input).map(|(r, _, _)| r)
}

fn evaluate_with_accumulators(
    policy: &LiquidityPolicy,
    existing_daily: f64,
    existing_counterparty: f64,
    input: &EvaluationInput,
) -> CoreResult<(EvaluationResult, f64, f64)> {
    if input.precedence_assertion != CANONICAL_PRECEDENCE {
        return Err(CoreError::constraint_violation(
            "liquidity_policy_precedence_violation",
        ));
    }

    let mut reasons = ReasonCodes::new();

    // 2. gate flags
    if !(input.safety_gate_passed && input.trust_gate_passed && input.commercial_gate_passed) {
        reasons.push("liquidity_policy_precedence_violation");
    }

    // 3. high-volatility pause
    if input.high_volatility && policy.high_volatility_mode == HighVolatilityMode::Pause {
        reasons.push("liquidity_policy_high_volatility_pause");
    }

    // 4. spread, possibly tightened
    let effective_max_spread_bps = if input.high_volatility && policy.high_volatility_mode == HighVolatilityMode::Tighten {
        policy.max_spread_bps / 2
    } else {
        policy.max_spread_bps
    };
    if input.spread_bps > effective_max_spread_bps {
        reasons.push("liquidity_policy_spread_exceeded");
    }

    // 5. price confidence
    if input.price_confidence_bps < policy.min_price_confidence_bps {
        reasons.push("liquidity_policy_price_confidence_low");
    }

    // 6. blocked tier
    if policy
        .blocked_asset_liquidity_tiers
        .iter()
        .any(|t| t == &input.asset_liquidity_tier)
    {
        reasons.push("liquidity_policy_exposure_exceeded");
    }

    // 7. exposure projection
    let projected_daily = round2(existing_daily + input.quote_value_usd);
    let projected_counterparty = round2(existing_counterparty + input.quote_value_usd);
    if projected_daily > policy.max_daily_value_usd
        || projected_counterparty > policy.max_counterparty_exposure_usd
    {
        reasons.push("liquidity_policy_exposure_exceeded");
    }

    // 8. quote-only mode
    if input.high_volatility
        && policy.high_volatility_mode == HighVolatilityMode::QuoteOnly
        && input.action_type != ActionType::Quote
    {
        reasons.push("liquidity_policy_precedence_violation");
    }

    let verdict = if reasons.seen.is_empty() {
        Verdict::Allow
    } else {
        Verdict::Deny
    };

    // spec.md §3: reason-code lists are deduped and lexicographically
    // sorted for chaining stability, not kept in insertion order.
    reasons.seen.sort();

    if verdict == Verdict::Deny {
        tracing::warn!(provider = %policy.provider_id, reasons = ?reasons.seen, "liquidity policy evaluation denied");
    } else {
        tracing::debug!(provider = %policy.provider_id, verdict = ?verdict, "liquidity policy evaluation allowed");
    }

    Ok((
        EvaluationResult {
            verdict,
            reason_codes: reasons.seen,
            effective_max_spread_bps,
            projected_daily_value_usd: projected_daily,
            projected_counterparty_exposure_usd: projected_counterparty,
        },
        projected_daily,
        projected_counterparty,
    ))
}

impl LiquidityPolicyStore {
    /// Run the evaluator against the provider's current policy, update the
    /// per-day/per-counterparty accumulators on `allow`, and append an
    /// immutable audit entry either way (spec.md §4.9 step 9).
    #[allow(clippy::too_many_arguments)]
    pub fn record_evaluation(
        &mut self,
        ledger: &mut Ledger,
        provider_id: &str,
        day_bucket: &str,
        eval_id: &str,
        now_iso: &str,
        input: &EvaluationInput,
    ) -> CoreResult<EvaluationResult> {
        let policy = self.get(provider_id)?;
        let daily_key = (provider_id.to_string(), day_bucket.to_string());
        let cp_key = (provider_id.to_string(), input.counterparty_actor_id.clone());
        let existing_daily = *self.daily_accumulator.get(&daily_key).unwrap_or(&0.0);
        let existing_cp = *self.counterparty_accumulator.get(&cp_key).unwrap_or(&0.0);

        let (result, projected_daily, projected_cp) =
            evaluate_with_accumulators(&policy, existing_daily, existing_cp, input)?;

        if result.verdict == Verdict::Allow {
            self.daily_accumulator.insert(daily_key, projected_daily);
            self.counterparty_accumulator.insert(cp_key, projected_cp);
        }

        let ms = crate::clock::parse_strict_iso8601(now_iso)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_default();
        let payload = serde_json::json!({
            "evaluation_id": eval_id,
            "provider_id": provider_id,
            "policy_version": policy.version,
            "verdict": result.verdict,
            "reason_codes": result.reason_codes,
            "input": input,
        });
        ledger.append(
            eval_id.to_string(),
            provider_id.to_string(),
            LEDGER_KIND,
            now_iso.to_string(),
            ms,
            payload,
        );
        tracing::debug!(provider_id, eval_id, verdict = ?result.verdict, "recorded liquidity policy evaluation");

        Ok(result)
    }

    /// `liquidity_policy_audit.export` (spec.md §6's `LIQUIDITY_POLICY_AUDIT_EXPORT_*`
    /// retention knobs): page the recorded evaluation audit trail for one
    /// provider through the generic export engine (spec.md §4.7).
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
