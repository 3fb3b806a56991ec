//! Marketplace matching shadow/canary/primary rollout controller (spec.md
//! §4.10). This is the hardest single piece of state in the core.
//!
//! The cycle-enumeration algorithm itself is an external collaborator whose
//! contract spec.md §1/§4.10 declares explicitly; [`CycleMatcher`] is that
//! contract and [`ReferenceCycleMatcher`] is one deterministic implementation
//! good enough to exercise every rollout-controller transition in tests,
//! without claiming parity with a production graph-cycle solver. Everything
//! *around* the matcher — canary bucketing, the rollback latch, shadow and
//! TS-shadow diffing — is implemented to the letter of §4.10's ten steps.

use crate::canonical::hex_sha256;
use crate::clock::{parse_strict_iso8601, to_iso8601};
use crate::config::MatchingV2Config;
use crate::dispatch::Actor;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// One side of a prospective trade: give `give_amount` of `give_asset`, want
/// `want_amount` of `want_asset`. Used uniformly for both "active user
/// intents" and "active edge intents" — the matcher contract takes both
/// pools and treats them as a single edge set over the asset graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub give_asset: String,
    pub give_amount: f64,
    pub want_asset: String,
    pub want_amount: f64,
}

/// Rotation-invariant canonicalization of an ordered intent-id cycle: rotate
/// so the lexicographically smallest intent id comes first (spec.md
/// GLOSSARY "Cycle key"). Used both to dedupe candidate cycles found from
/// different start points and to compare engines' selected proposals in
/// shadow diffs.
pub fn cycle_key(intents: &[Intent], path: &[usize]) -> String {
    let ids: Vec<&str> = path.iter().map(|&i| intents[i].intent_id.as_str()).collect();
    let min_pos = ids
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut rotated: Vec<&str> = Vec::with_capacity(ids.len());
    rotated.extend_from_slice(&ids[min_pos..]);
    rotated.extend_from_slice(&ids[..min_pos]);
    rotated.join(">")
}

fn build_adjacency(intents: &[Intent]) -> HashMap<&str, Vec<usize>> {
    let mut by_give: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, intent) in intents.iter().enumerate() {
        by_give.entry(intent.give_asset.as_str()).or_default().push(i);
    }
    by_give
}

#[allow(clippy::too_many_arguments)]
fn dfs_extend(
    intents: &[Intent],
    by_give: &HashMap<&str, Vec<usize>>,
    start_give_asset: &str,
    current_want_asset: &str,
    path: &mut Vec<usize>,
    used: &mut HashSet<usize>,
    min_len: usize,
    max_len: usize,
    max_cycles: usize,
    deadline: Instant,
    seen_keys: &mut HashSet<String>,
    cycles: &mut Vec<Vec<usize>>,
    limited: &mut bool,
    timed_out: &mut bool,
) -> bool {
    if Instant::now() >= deadline {
        *timed_out = true;
        return false;
    }
    if path.len() >= min_len && current_want_asset == start_give_asset {
        let key = cycle_key(intents, path);
        if seen_keys.insert(key) {
            cycles.push(path.clone());
            if cycles.len() >= max_cycles {
                *limited = true;
                return false;
            }
        }
    }
    if path.len() == max_len {
        return true;
    }
    if let Some(next_indices) = by_give.get(current_want_asset) {
        for &next_idx in next_indices {
            if used.contains(&next_idx) {
                continue;
            }
            path.push(next_idx);
            used.insert(next_idx);
            let next_want = intents[next_idx].want_asset.as_str();
            let cont = dfs_extend(
                intents, by_give, start_give_asset, next_want, path, used, min_len, max_len,
                max_cycles, deadline, seen_keys, cycles, limited, timed_out,
            );
            path.pop();
            used.remove(&next_idx);
            if !cont {
                return false;
            }
        }
    }
    true
}

/// Enumerate simple cycles of length in `[min_len, max_len]` over the
/// directed asset graph implied by `intents`, bounded by `max_cycles` and a
/// wall-clock `deadline`. Deterministic: intents are walked in the order
/// given, which callers must have already sorted by `intent_id`.
fn enumerate_cycles(
    intents: &[Intent],
    min_len: usize,
    max_len: usize,
    max_cycles: usize,
    deadline: Instant,
) -> (Vec<Vec<usize>>, bool, bool) {
    let by_give = build_adjacency(intents);
    let mut seen_keys = HashSet::new();
    let mut cycles = Vec::new();
    let mut limited = false;
    let mut timed_out = false;

    for start_idx in 0..intents.len() {
        let start = &intents[start_idx];
        let mut path = vec![start_idx];
        let mut used = HashSet::new();
        used.insert(start_idx);
        let keep_going = dfs_extend(
            intents,
            &by_give,
            start.give_asset.as_str(),
            start.want_asset.as_str(),
            &mut path,
            &mut used,
            min_len,
            max_len,
            max_cycles,
            deadline,
            &mut seen_keys,
            &mut cycles,
            &mut limited,
            &mut timed_out,
        );
        if !keep_going {
            break;
        }
    }
    (cycles, limited, timed_out)
}

fn confidence_score(intents: &[Intent], path: &[usize], asset_values: &HashMap<String, f64>) -> f64 {
    let mut total_value = 0.0;
    let mut delta = 0.0;
    for &i in path {
        let intent = &intents[i];
        let give_v = intent.give_amount * asset_values.get(&intent.give_asset).copied().unwrap_or(0.0);
        let want_v = intent.want_amount * asset_values.get(&intent.want_asset).copied().unwrap_or(0.0);
        total_value += give_v.abs();
        delta += give_v - want_v;
    }
    if total_value <= 0.0 {
        return 0.0;
    }
    (1.0 - (delta.abs() / total_value)).clamp(0.0, 1.0)
}

/// Which tie-break order a matcher implementation applies when greedily
/// selecting non-overlapping cycles. The two v2 implementations (candidate
/// "v2" and alternate "v2'" used only as a TS-shadow) differ here rather
/// than in the enumeration itself, which is enough to produce the kind of
/// selection divergence a shadow diff exists to catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    ConfidenceThenKey,
    KeyThenConfidence,
}

fn select_proposals(
    intents: &[Intent],
    cycles: &[Vec<usize>],
    asset_values: &HashMap<String, f64>,
    tie_break: TieBreak,
) -> Vec<(Vec<usize>, String, f64)> {
    let mut scored: Vec<(Vec<usize>, String, f64)> = cycles
        .iter()
        .map(|c| {
            let key = cycle_key(intents, c);
            let score = confidence_score(intents, c, asset_values);
            (c.clone(), key, score)
        })
        .collect();
    match tie_break {
        TieBreak::ConfidenceThenKey => scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.1.cmp(&b.1))
        }),
        TieBreak::KeyThenConfidence => scored.sort_by(|a, b| {
            a.1.cmp(&b.1).then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        }),
    }
    let mut used = HashSet::new();
    let mut selected = Vec::new();
    for (cycle, key, score) in scored {
        if cycle.iter().any(|i| used.contains(i)) {
            continue;
        }
        for i in &cycle {
            used.insert(*i);
        }
        selected.push((cycle, key, score));
    }
    selected
}

/// Input to one matcher run (spec.md §4.10's declared contract).
pub struct MatcherInput<'a> {
    pub intents: &'a [Intent],
    pub intents_active: usize,
    pub asset_values: &'a HashMap<String, f64>,
    pub min_cycle_length: usize,
    pub max_cycle_length: usize,
    pub max_enumerated_cycles: usize,
    pub timeout_ms: u64,
    pub include_diagnostics: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatcherStats {
    pub intents_active: usize,
    pub edges: usize,
    pub candidate_cycles: usize,
    pub candidate_proposals: usize,
    pub selected_proposals: usize,
    pub cycle_enumeration_limited: bool,
    pub cycle_enumeration_timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCycle {
    pub cycle: Vec<String>,
    pub cycle_key: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatcherOutput {
    pub proposals: Vec<ScoredCycle>,
    pub stats: MatcherStats,
}

/// Reserved for genuine exceptions (matches §4.10 step 6's "on exception").
/// Timeout and cycle-cap exhaustion are *not* modeled as errors — they are
/// ordinary outcomes reported via `MatcherStats`, consistent with the
/// contract producing `{proposals, stats}` unconditionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    Injected(String),
}

pub trait CycleMatcher: Send + Sync {
    fn run(&self, input: &MatcherInput) -> Result<MatcherOutput, MatcherError>;
}

/// One deterministic reference implementation of the cycle-enumeration
/// contract. `force_error`/`force_timeout` are test-only injection hooks
/// standing in for the "forced/actual" timeout and exception paths spec.md
/// §4.10 step 6 requires the controller to react to.
pub struct ReferenceCycleMatcher {
    pub tie_break: TieBreak,
    pub force_error: bool,
    pub force_timeout: bool,
}

impl ReferenceCycleMatcher {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            force_error: false,
            force_timeout: false,
        }
    }

    pub fn with_force_error(mut self, v: bool) -> Self {
        self.force_error = v;
        self
    }

    pub fn with_force_timeout(mut self, v: bool) -> Self {
        self.force_timeout = v;
        self
    }
}

impl CycleMatcher for ReferenceCycleMatcher {
    fn run(&self, input: &MatcherInput) -> Result<MatcherOutput, MatcherError> {
        if self.force_error {
            return Err(MatcherError::Injected("forced_error".to_string()));
        }
        let deadline = if self.force_timeout {
            Instant::now()
        } else {
            Instant::now() + Duration::from_millis(input.timeout_ms.max(1))
        };
        let (cycles, limited, timed_out) = enumerate_cycles(
            input.intents,
            input.min_cycle_length,
            input.max_cycle_length,
            input.max_enumerated_cycles.max(1),
            deadline,
        );
        let selected = select_proposals(input.intents, &cycles, input.asset_values, self.tie_break);
        let proposals: Vec<ScoredCycle> = selected
            .into_iter()
            .map(|(cycle, key, score)| ScoredCycle {
                cycle: cycle.into_iter().map(|i| input.intents[i].intent_id.clone()).collect(),
                cycle_key: key,
                confidence_score: score,
            })
            .collect();
        let stats = MatcherStats {
            intents_active: input.intents_active,
            edges: input.intents.len(),
            candidate_cycles: cycles.len(),
            candidate_proposals: cycles.len(),
            selected_proposals: proposals.len(),
            cycle_enumeration_limited: limited,
            cycle_enumeration_timed_out: timed_out,
        };
        Ok(MatcherOutput { proposals, stats })
    }
}

/// Deterministic canary bucket in `[0, 10000)`, derived from
/// `SHA256(salt || actor.type || actor.id || idempotency_key ||
/// requested_at)`'s first 8 bytes mod 10000 (spec.md §4.10 step 5).
pub fn canary_bucket(salt: &str, actor: &Actor, idempotency_key: &str, requested_at: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(format!("{:?}", actor.actor_type).as_bytes());
    hasher.update(actor.id.as_bytes());
    hasher.update(idempotency_key.as_bytes());
    hasher.update(requested_at.as_bytes());
    let digest = hasher.finalize();
    let first8 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    (first8 % 10_000) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTag {
    V1,
    V2,
}

#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub run_id: String,
    pub cycle: Vec<String>,
    pub cycle_key: String,
    pub confidence_score: f64,
    pub expires_at: Option<String>,
    pub engine: EngineTag,
    /// Actors this proposal is visible to (spec.md:158's "filtered by
    /// actor-visibility rules"): the partner whose run produced it. Consumed
    /// by `domain::products`'s read-only projections.
    pub visible_to: Vec<Actor>,
}

#[derive(Debug, Clone, Default)]
struct CanarySample {
    error: bool,
    timeout: bool,
    limited: bool,
    non_negative_delta: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackLatch {
    pub active: bool,
    pub trigger_reason_code: Option<String>,
    pub rollback_run_id: Option<String>,
    pub rollback_activated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShadowDiff {
    pub diff_id: String,
    pub run_id: String,
    pub primary_cycle_count: usize,
    pub shadow_cycle_count: usize,
    pub primary_selected_count: usize,
    pub shadow_selected_count: usize,
    pub overlap_cycle_keys: Vec<String>,
    pub delta_score_sum_scaled: i64,
    pub recorded_at: String,
}

fn scaled_sum(props: &[ScoredCycle]) -> i64 {
    props.iter().map(|p| (p.confidence_score * 10_000.0).round() as i64).sum()
}

fn compute_diff(
    diff_id: &str,
    run_id: &str,
    primary: &MatcherOutput,
    shadow: &MatcherOutput,
    now_iso: &str,
) -> ShadowDiff {
    let primary_keys: HashSet<&str> = primary.proposals.iter().map(|p| p.cycle_key.as_str()).collect();
    let mut overlap: Vec<String> = shadow
        .proposals
        .iter()
        .filter(|p| primary_keys.contains(p.cycle_key.as_str()))
        .map(|p| p.cycle_key.clone())
        .collect();
    overlap.sort();
    overlap.dedup();
    ShadowDiff {
        diff_id: diff_id.to_string(),
        run_id: run_id.to_string(),
        primary_cycle_count: primary.stats.candidate_cycles,
        shadow_cycle_count: shadow.stats.candidate_cycles,
        primary_selected_count: primary.proposals.len(),
        shadow_selected_count: shadow.proposals.len(),
        overlap_cycle_keys: overlap,
        delta_score_sum_scaled: scaled_sum(&shadow.proposals) - scaled_sum(&primary.proposals),
        recorded_at: now_iso.to_string(),
    }
}

#[derive(Default)]
struct TenantMatchingState {
    proposals: HashMap<String, Proposal>,
    proposal_run: HashMap<String, String>,
    canary_samples: VecDeque<CanarySample>,
    rollback: RollbackLatch,
    shadow_diffs: VecDeque<ShadowDiff>,
    ts_shadow_diffs: VecDeque<ShadowDiff>,
}

/// One full run request (spec.md §4.10 steps 1-10).
pub struct RunRequest<'a> {
    pub tenant_id: &'a str,
    pub run_id: &'a str,
    pub actor: &'a Actor,
    pub idempotency_key: &'a str,
    pub requested_at: &'a str,
    pub stored_asset_values: &'a HashMap<String, f64>,
    pub derived_asset_values: &'a HashMap<String, f64>,
    pub request_asset_values: &'a HashMap<String, f64>,
    pub active_user_intents: &'a [Intent],
    pub active_edge_intents: &'a [Intent],
    pub replace_existing: bool,
    pub max_proposals: usize,
    pub primary_enabled: bool,
    pub canary_enabled: bool,
    pub shadow_enabled: bool,
    pub ts_shadow_enabled: bool,
    pub force_bucket_v2: bool,
    pub fallback_on_timeout: bool,
    pub fallback_on_limited: bool,
    pub rollback_reset: bool,
    pub force_v2_error: bool,
    pub force_v2_timeout: bool,
    pub salt: &'a str,
    pub config: &'a MatchingV2Config,
    /// How long a freshly persisted proposal stays live before step 2 of a
    /// later run is eligible to expire it (spec.md §4.10 step 2), in
    /// milliseconds from `requested_at`.
    pub proposal_lifetime_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub primary_engine: EngineTag,
    pub fallback_reason_code: Option<String>,
    pub skipped_reason: Option<String>,
    pub canary_bucket: u32,
    pub proposals: Vec<Proposal>,
    pub v1_stats: MatcherStats,
    pub v2_stats: Option<MatcherStats>,
    pub shadow_diff_id: Option<String>,
    pub ts_shadow_diff_id: Option<String>,
    pub rollback_latch_active: bool,
}

#[derive(Default)]
pub struct MatchingRolloutController {
    tenants: HashMap<String, TenantMatchingState>,
}

impl MatchingRolloutController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rollback_latch(&self, tenant_id: &str) -> RollbackLatch {
        self.tenants.get(tenant_id).map(|t| t.rollback.clone()).unwrap_or_default()
    }

    pub fn active_proposals(&self, tenant_id: &str) -> Vec<Proposal> {
        self.tenants
            .get(tenant_id)
            .map(|t| {
                let mut v: Vec<Proposal> = t.proposals.values().cloned().collect();
                v.sort_by(|a, b| a.proposal_id.cmp(&b.proposal_id));
                v
            })
            .unwrap_or_default()
    }

    pub fn shadow_diffs(&self, tenant_id: &str) -> Vec<ShadowDiff> {
        self.tenants.get(tenant_id).map(|t| t.shadow_diffs.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn ts_shadow_diffs(&self, tenant_id: &str) -> Vec<ShadowDiff> {
        self.tenants.get(tenant_id).map(|t| t.ts_shadow_diffs.iter().cloned().collect()).unwrap_or_default()
    }

    /// Run one cycle-enumeration pass through the full rollout controller
    /// (spec.md §4.10 steps 1-10). `mint_proposal_id` mints an id per
    /// persisted proposal; `is_in_use` reports whether a previously-persisted
    /// proposal is referenced by a downstream commit/timeline/receipt/
    /// reservation and therefore exempt from expiry/replacement deletion.
    pub fn run(
        &mut self,
        req: &RunRequest,
        mint_proposal_id: &mut dyn FnMut() -> String,
        mint_diff_id: &mut dyn FnMut() -> String,
        is_in_use: &dyn Fn(&str) -> bool,
    ) -> CoreResult<RunOutcome> {
        tracing::debug!(
            tenant_id = req.tenant_id,
            run_id = req.run_id,
            primary_enabled = req.primary_enabled,
            canary_enabled = req.canary_enabled,
            "matching rollout run starting"
        );

        // step 1: merge asset values, right-biased.
        let mut asset_values = req.stored_asset_values.clone();
        for (k, v) in req.derived_asset_values {
            asset_values.insert(k.clone(), *v);
        }
        for (k, v) in req.request_asset_values {
            asset_values.insert(k.clone(), *v);
        }
        if asset_values.is_empty() {
            return Err(CoreError::constraint_violation("asset_values_missing"));
        }

        let tenant = self.tenants.entry(req.tenant_id.to_string()).or_default();
        let latch_was_active_before = tenant.rollback.active;

        // step 2: expire previously-produced proposals not held in use.
        let now_ms = parse_strict_iso8601(req.requested_at).map(|d| d.timestamp_millis()).unwrap_or(i64::MAX);
        let expired: Vec<String> = tenant
            .proposals
            .iter()
            .filter(|(id, p)| {
                p.expires_at
                    .as_deref()
                    .and_then(|e| parse_strict_iso8601(e).ok())
                    .map(|e| e.timestamp_millis() < now_ms)
                    .unwrap_or(false)
                    && !is_in_use(id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            tenant.proposals.remove(id);
            tenant.proposal_run.remove(id);
        }

        // step 3: replace_existing deletes all prior not-in-use proposals.
        if req.replace_existing {
            let to_remove: Vec<String> =
                tenant.proposals.keys().filter(|id| !is_in_use(id)).cloned().collect();
            for id in to_remove {
                tenant.proposals.remove(&id);
                tenant.proposal_run.remove(&id);
            }
        }

        let mut all_intents: Vec<Intent> = req.active_user_intents.to_vec();
        all_intents.extend(req.active_edge_intents.iter().cloned());
        all_intents.sort_by(|a, b| a.intent_id.cmp(&b.intent_id));

        // step 4: run v1 with fixed bounds.
        let v1_input = MatcherInput {
            intents: &all_intents,
            intents_active: req.active_user_intents.len(),
            asset_values: &asset_values,
            min_cycle_length: 2,
            max_cycle_length: 3,
            max_enumerated_cycles: req.config.max_cycles_explored as usize,
            timeout_ms: req.config.timeout_ms,
            include_diagnostics: true,
        };
        let v1_matcher = ReferenceCycleMatcher::new(TieBreak::ConfidenceThenKey);
        let v1_output = v1_matcher
            .run(&v1_input)
            .map_err(|_| CoreError::constraint_violation("matching_v1_failed"))?;

        if req.primary_enabled && req.rollback_reset {
            if tenant.rollback.active {
                tracing::warn!(tenant_id = req.tenant_id, run_id = req.run_id, "matching v2 rollback latch reset");
            }
            tenant.rollback = RollbackLatch::default();
            tenant.canary_samples.clear();
        }

        // step 5: canary/primary selection.
        let bucket = canary_bucket(req.salt, req.actor, req.idempotency_key, req.requested_at);
        let mut primary_engine = EngineTag::V1;
        let mut primary_output = v1_output.clone_shallow();
        let mut fallback_reason_code: Option<String> = None;
        let mut skipped_reason: Option<String> = None;
        let mut v2_output: Option<MatcherOutput> = None;
        let mut is_canary_selected = false;

        let wants_v2 = req.primary_enabled || req.canary_enabled;
        let v2_input = MatcherInput {
            intents: &all_intents,
            intents_active: req.active_user_intents.len(),
            asset_values: &asset_values,
            min_cycle_length: req.config.min_cycle_length as usize,
            max_cycle_length: req.config.max_cycle_length as usize,
            max_enumerated_cycles: req.config.max_cycles_explored as usize,
            timeout_ms: req.config.timeout_ms,
            include_diagnostics: true,
        };

        if wants_v2 {
            if tenant.rollback.active {
                skipped_reason = Some("rollback_active".to_string());
            } else if !req.primary_enabled {
                if bucket < req.config.rollout_bps || req.force_bucket_v2 {
                    is_canary_selected = true;
                } else {
                    skipped_reason = Some("rollout_excluded".to_string());
                }
            }
        }

        // step 6: run v2 (unconditionally in primary mode, only when the
        // canary bucket selected this request otherwise).
        let should_run_v2 = wants_v2 && skipped_reason.is_none();
        let mut v2_error = false;
        if should_run_v2 {
            let matcher = ReferenceCycleMatcher::new(TieBreak::ConfidenceThenKey)
                .with_force_error(req.force_v2_error)
                .with_force_timeout(req.force_v2_timeout);
            match matcher.run(&v2_input) {
                Ok(output) => {
                    let mut fell_back = false;
                    if req.primary_enabled {
                        if output.stats.cycle_enumeration_timed_out && req.fallback_on_timeout {
                            fallback_reason_code = Some("v2_timeout_safety".to_string());
                            fell_back = true;
                        } else if output.stats.cycle_enumeration_limited && req.fallback_on_limited {
                            fallback_reason_code = Some("v2_limited_safety".to_string());
                            fell_back = true;
                        }
                    }
                    if fell_back {
                        primary_engine = EngineTag::V1;
                        primary_output = v1_output.clone_shallow();
                        tracing::warn!(
                            tenant_id = req.tenant_id,
                            run_id = req.run_id,
                            reason = fallback_reason_code.as_deref(),
                            "matching v2 fell back to v1"
                        );
                    } else {
                        primary_engine = EngineTag::V2;
                        primary_output = output.clone_shallow();
                    }
                    v2_output = Some(output);
                }
                Err(_) => {
                    v2_error = true;
                    primary_engine = EngineTag::V1;
                    primary_output = v1_output.clone_shallow();
                    fallback_reason_code = Some(
                        if req.primary_enabled { "v2_error" } else { "canary_error" }.to_string(),
                    );
                    tracing::warn!(
                        tenant_id = req.tenant_id,
                        run_id = req.run_id,
                        reason = fallback_reason_code.as_deref(),
                        "matching v2 run errored, falling back to v1"
                    );
                }
            }
        }

        // steps 7-8: shadow and TS-shadow diffing are independent pure matcher
        // runs over the same read-only `v2_input`, so they execute on rayon's
        // pool concurrently; only the diff-id minting and tenant-state update
        // that follows needs to stay on this thread.
        let want_shadow =
            req.shadow_enabled && !should_run_v2 && !(req.primary_enabled && latch_was_active_before);
        let want_ts_shadow = req.ts_shadow_enabled;
        let (shadow_output, ts_output) = rayon::join(
            || {
                want_shadow
                    .then(|| ReferenceCycleMatcher::new(TieBreak::ConfidenceThenKey).run(&v2_input).ok())
                    .flatten()
            },
            || {
                want_ts_shadow
                    .then(|| ReferenceCycleMatcher::new(TieBreak::KeyThenConfidence).run(&v2_input).ok())
                    .flatten()
            },
        );

        let mut shadow_diff_id = None;
        if let Some(shadow_output) = shadow_output {
            let diff_id = mint_diff_id();
            let diff = compute_diff(&diff_id, req.run_id, &v1_output, &shadow_output, req.requested_at);
            tenant.shadow_diffs.push_back(diff);
            while tenant.shadow_diffs.len() > req.config.max_shadow_diffs {
                tenant.shadow_diffs.pop_front();
            }
            shadow_diff_id = Some(diff_id);
        }

        let mut ts_shadow_diff_id = None;
        if let Some(ts_output) = ts_output {
            let diff_id = mint_diff_id();
            let diff = compute_diff(&diff_id, req.run_id, &primary_output, &ts_output, req.requested_at);
            tenant.ts_shadow_diffs.push_back(diff);
            while tenant.ts_shadow_diffs.len() > req.config.max_ts_shadow_diffs {
                tenant.ts_shadow_diffs.pop_front();
            }
            ts_shadow_diff_id = Some(diff_id);
        }

        // step 9: persist sliced primary proposals.
        let expires_at = parse_strict_iso8601(req.requested_at)
            .ok()
            .map(|requested| to_iso8601(requested + chrono::Duration::milliseconds(req.proposal_lifetime_ms)));
        let sliced: Vec<&ScoredCycle> = primary_output.proposals.iter().take(req.max_proposals).collect();
        let mut persisted = Vec::with_capacity(sliced.len());
        for scored in sliced {
            let proposal_id = mint_proposal_id();
            let proposal = Proposal {
                proposal_id: proposal_id.clone(),
                run_id: req.run_id.to_string(),
                cycle: scored.cycle.clone(),
                cycle_key: scored.cycle_key.clone(),
                confidence_score: scored.confidence_score,
                expires_at: expires_at.clone(),
                engine: primary_engine,
                visible_to: vec![req.actor.clone()],
            };
            tenant.proposals.insert(proposal_id.clone(), proposal.clone());
            tenant.proposal_run.insert(proposal_id, req.run_id.to_string());
            persisted.push(proposal);
        }

        // step 10: update canary rollback sampling window and maybe trip the latch.
        if is_canary_selected {
            let delta = v2_output
                .as_ref()
                .map(|o| scaled_sum(&o.proposals) - scaled_sum(&v1_output.proposals))
                .unwrap_or(0);
            let sample = CanarySample {
                error: v2_error,
                timeout: v2_output.as_ref().map(|o| o.stats.cycle_enumeration_timed_out).unwrap_or(false),
                limited: v2_output.as_ref().map(|o| o.stats.cycle_enumeration_limited).unwrap_or(false),
                non_negative_delta: delta >= 0,
            };
            tenant.canary_samples.push_back(sample);
            while tenant.canary_samples.len() > req.config.rollback_window_runs {
                tenant.canary_samples.pop_front();
            }
            maybe_trip_latch(tenant, req.config, req.run_id, req.requested_at);
        }

        let v2_stats = v2_output.as_ref().map(|o| o.stats.clone());
        Ok(RunOutcome {
            run_id: req.run_id.to_string(),
            primary_engine,
            fallback_reason_code,
            skipped_reason,
            canary_bucket: bucket,
            proposals: persisted,
            v1_stats: v1_output.stats,
            v2_stats,
            shadow_diff_id,
            ts_shadow_diff_id,
            rollback_latch_active: tenant.rollback.active,
        })
    }
}

fn maybe_trip_latch(tenant: &mut TenantMatchingState, cfg: &MatchingV2Config, run_id: &str, now_iso: &str) {
    if tenant.rollback.active {
        return;
    }
    if tenant.canary_samples.is_empty() {
        return;
    }
    let n = tenant.canary_samples.len() as f64;
    let error_rate = tenant.canary_samples.iter().filter(|s| s.error).count() as f64 / n;
    let timeout_rate = tenant.canary_samples.iter().filter(|s| s.timeout).count() as f64 / n;
    let limited_rate = tenant.canary_samples.iter().filter(|s| s.limited).count() as f64 / n;
    let negative_delta_rate =
        tenant.canary_samples.iter().filter(|s| !s.non_negative_delta).count() as f64 / n;

    let reason = if error_rate >= cfg.canary_error_rate_threshold {
        Some("canary_error_rate_exceeded")
    } else if timeout_rate >= cfg.canary_timeout_rate_threshold {
        Some("canary_timeout_rate_exceeded")
    } else if limited_rate >= cfg.canary_limited_rate_threshold {
        Some("canary_limited_rate_exceeded")
    } else if negative_delta_rate >= cfg.canary_negative_delta_rate_threshold {
        Some("canary_negative_delta_rate_exceeded")
    } else {
        None
    };

    if let Some(reason) = reason {
        tracing::warn!(run_id, reason, error_rate, timeout_rate, limited_rate, negative_delta_rate, "matching v2 rollback latch tripped");
        tenant.rollback = RollbackLatch {
            active: true,
            trigger_reason_code: Some(reason.to_string()),
            rollback_run_id: Some(run_id.to_string()),
            rollback_activated_at: Some(now_iso.to_string()),
        };
    }
}

impl MatcherOutput {
    fn clone_shallow(&self) -> Self {
        MatcherOutput {
            proposals: self.proposals.clone(),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ActorType;

    fn actor() -> Actor {
        Actor::new(ActorType::Partner, "p1")
    }

    fn three_cycle() -> Vec<Intent> {
        vec![
            Intent { intent_id: "i1".into(), give_asset: "A".into(), give_amount: 10.0, want_asset: "B".into(), want_amount: 10.0 },
            Intent { intent_id: "i2".into(), give_asset: "B".into(), give_amount: 10.0, want_asset: "C".into(), want_amount: 10.0 },
            Intent { intent_id: "i3".into(), give_asset: "C".into(), give_amount: 10.0, want_asset: "A".into(), want_amount: 10.0 },
        ]
    }

    fn values() -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("A".to_string(), 1.0);
        m.insert("B".to_string(), 1.0);
        m.insert("C".to_string(), 1.0);
        m
    }

    #[test]
    fn cycle_key_is_rotation_invariant() {
        let intents = three_cycle();
        let k1 = cycle_key(&intents, &[0, 1, 2]);
        let k2 = cycle_key(&intents, &[1, 2, 0]);
        let k3 = cycle_key(&intents, &[2, 0, 1]);
        assert_eq!(k1, k2);
        assert_eq!(k2, k3);
    }

    #[test]
    fn reference_matcher_finds_the_three_cycle() {
        let intents = three_cycle();
        let asset_values = values();
        let input = MatcherInput {
            intents: &intents,
            intents_active: 3,
            asset_values: &asset_values,
            min_cycle_length: 2,
            max_cycle_length: 3,
            max_enumerated_cycles: 1000,
            timeout_ms: 250,
            include_diagnostics: true,
        };
        let output = ReferenceCycleMatcher::new(TieBreak::ConfidenceThenKey).run(&input).unwrap();
        assert_eq!(output.proposals.len(), 1);
        assert_eq!(output.proposals[0].cycle.len(), 3);
        assert!(output.proposals[0].confidence_score > 0.99);
    }

    #[test]
    fn canary_bucket_is_deterministic_for_identical_inputs() {
        let a = actor();
        let b1 = canary_bucket("salt", &a, "k1", "2025-01-01T00:00:00.000Z");
        let b2 = canary_bucket("salt", &a, "k1", "2025-01-01T00:00:00.000Z");
        assert_eq!(b1, b2);
        assert!(b1 < 10_000);
    }

    #[test]
    fn asset_values_missing_is_rejected() {
        let mut ctrl = MatchingRolloutController::new();
        let empty: HashMap<String, f64> = HashMap::new();
        let cfg = MatchingV2Config::default();
        let req = RunRequest {
            tenant_id: "t1",
            run_id: "run_1",
            actor: &actor(),
            idempotency_key: "k1",
            requested_at: "2025-01-01T00:00:00.000Z",
            stored_asset_values: &empty,
            derived_asset_values: &empty,
            request_asset_values: &empty,
            active_user_intents: &[],
            active_edge_intents: &[],
            replace_existing: false,
            max_proposals: 10,
            primary_enabled: false,
            canary_enabled: false,
            shadow_enabled: false,
            ts_shadow_enabled: false,
            force_bucket_v2: false,
            fallback_on_timeout: false,
            fallback_on_limited: false,
            rollback_reset: false,
            force_v2_error: false,
            force_v2_timeout: false,
            salt: "salt",
            config: &cfg,
            proposal_lifetime_ms: cfg.proposal_lifetime_ms,
        };
        let mut pid = 0u64;
        let mut did = 0u64;
        let err = ctrl
            .run(&req, &mut || { pid += 1; format!("prop_{pid}") }, &mut || { did += 1; format!("diff_{did}") }, &|_| false)
            .unwrap_err();
        assert_eq!(err.reason_code(), Some("asset_values_missing"));
    }

    /// S6: with `rollout_bps=10000` (always selected) and forced v2 errors,
    /// enough consecutive error samples trip the rollback latch; the next
    /// run after that reports `skipped_reason=rollback_active` with
    /// `primary_engine=v1`.
    #[test]
    fn s6_repeated_canary_errors_trip_the_rollback_latch() {
        let mut ctrl = MatchingRolloutController::new();
        let mut cfg = MatchingV2Config::default();
        cfg.rollout_bps = 10_000;
        cfg.rollback_window_runs = 2;
        cfg.canary_error_rate_threshold = 0.5;
        let intents = three_cycle();
        let asset_values = values();
        let mut pid = 0u64;
        let mut did = 0u64;
        let mut next_pid = || { pid += 1; format!("prop_{pid}") };
        let mut next_did = || { did += 1; format!("diff_{did}") };

        let make_req = |run_id: &'static str, requested_at: &'static str| RunRequest {
            tenant_id: "t1",
            run_id,
            actor: &Actor::new(ActorType::Partner, "p1"),
            idempotency_key: "k1",
            requested_at,
            stored_asset_values: &asset_values,
            derived_asset_values: &HashMap::new(),
            request_asset_values: &HashMap::new(),
            active_user_intents: &intents,
            active_edge_intents: &[],
            replace_existing: false,
            max_proposals: 10,
            primary_enabled: false,
            canary_enabled: true,
            shadow_enabled: false,
            ts_shadow_enabled: false,
            force_bucket_v2: false,
            fallback_on_timeout: false,
            fallback_on_limited: false,
            rollback_reset: false,
            force_v2_error: true,
            force_v2_timeout: false,
            salt: "salt",
            config: &cfg,
            proposal_lifetime_ms: cfg.proposal_lifetime_ms,
        };

        let r1 = ctrl
            .run(&make_req("run_1", "2025-01-01T00:00:00.000Z"), &mut next_pid, &mut next_did, &|_| false)
            .unwrap();
        assert_eq!(r1.fallback_reason_code.as_deref(), Some("canary_error"));
        assert!(!r1.rollback_latch_active);

        let r2 = ctrl
            .run(&make_req("run_2", "2025-01-01T00:01:00.000Z"), &mut next_pid, &mut next_did, &|_| false)
            .unwrap();
        assert_eq!(r2.fallback_reason_code.as_deref(), Some("canary_error"));
        assert!(r2.rollback_latch_active);

        let r3 = ctrl
            .run(&make_req("run_3", "2025-01-01T00:02:00.000Z"), &mut next_pid, &mut next_did, &|_| false)
            .unwrap();
        assert_eq!(r3.skipped_reason.as_deref(), Some("rollback_active"));
        assert_eq!(r3.primary_engine, EngineTag::V1);
    }

    #[test]
    fn rollback_reset_clears_latch_only_in_primary_mode() {
        let mut ctrl = MatchingRolloutController::new();
        let mut cfg = MatchingV2Config::default();
        cfg.rollout_bps = 10_000;
        cfg.rollback_window_runs = 1;
        cfg.canary_error_rate_threshold = 0.5;
        let intents = three_cycle();
        let asset_values = values();
        let mut pid = 0u64;
        let mut did = 0u64;
        let mut next_pid = || { pid += 1; format!("prop_{pid}") };
        let mut next_did = || { did += 1; format!("diff_{did}") };

        let a = Actor::new(ActorType::Partner, "p1");
        let trip_req = RunRequest {
            tenant_id: "t1",
            run_id: "run_1",
            actor: &a,
            idempotency_key: "k1",
            requested_at: "2025-01-01T00:00:00.000Z",
            stored_asset_values: &asset_values,
            derived_asset_values: &HashMap::new(),
            request_asset_values: &HashMap::new(),
            active_user_intents: &intents,
            active_edge_intents: &[],
            replace_existing: false,
            max_proposals: 10,
            primary_enabled: false,
            canary_enabled: true,
            shadow_enabled: false,
            ts_shadow_enabled: false,
            force_bucket_v2: false,
            fallback_on_timeout: false,
            fallback_on_limited: false,
            rollback_reset: false,
            force_v2_error: true,
            force_v2_timeout: false,
            salt: "salt",
            config: &cfg,
            proposal_lifetime_ms: cfg.proposal_lifetime_ms,
        };
        let r1 = ctrl.run(&trip_req, &mut next_pid, &mut next_did, &|_| false).unwrap();
        assert!(r1.rollback_latch_active);

        let reset_req = RunRequest {
            run_id: "run_2",
            requested_at: "2025-01-01T00:01:00.000Z",
            primary_enabled: true,
            canary_enabled: false,
            rollback_reset: true,
            force_v2_error: false,
            ..trip_req
        };
        let r2 = ctrl.run(&reset_req, &mut next_pid, &mut next_did, &|_| false).unwrap();
        assert!(!r2.rollback_latch_active);
        assert_eq!(r2.primary_engine, EngineTag::V2);
    }

    /// spec.md §4.10 step 2: a previously-produced proposal whose
    /// `expires_at < now` and which is not held in use by a downstream
    /// reference is dropped at the start of the next run.
    #[test]
    fn step2_drops_expired_proposals_not_held_in_use() {
        let mut ctrl = MatchingRolloutController::new();
        let mut cfg = MatchingV2Config::default();
        cfg.proposal_lifetime_ms = 1_000;
        let intents = three_cycle();
        let asset_values = values();
        let mut pid = 0u64;
        let mut did = 0u64;
        let mut next_pid = || { pid += 1; format!("prop_{pid}") };
        let mut next_did = || { did += 1; format!("diff_{did}") };

        let req1 = RunRequest {
            tenant_id: "t1",
            run_id: "run_1",
            actor: &actor(),
            idempotency_key: "k1",
            requested_at: "2025-01-01T00:00:00.000Z",
            stored_asset_values: &asset_values,
            derived_asset_values: &HashMap::new(),
            request_asset_values: &HashMap::new(),
            active_user_intents: &intents,
            active_edge_intents: &[],
            replace_existing: false,
            max_proposals: 10,
            primary_enabled: false,
            canary_enabled: false,
            shadow_enabled: false,
            ts_shadow_enabled: false,
            force_bucket_v2: false,
            fallback_on_timeout: false,
            fallback_on_limited: false,
            rollback_reset: false,
            force_v2_error: false,
            force_v2_timeout: false,
            salt: "salt",
            config: &cfg,
            proposal_lifetime_ms: cfg.proposal_lifetime_ms,
        };
        let r1 = ctrl.run(&req1, &mut next_pid, &mut next_did, &|_| false).unwrap();
        assert_eq!(r1.proposals.len(), 1);
        assert_eq!(ctrl.active_proposals("t1").len(), 1);

        // Second run, well past the 1s lifetime, with an empty intent pool so
        // it produces no new proposals of its own; the only way to observe
        // the first proposal disappearing is step 2's expiry sweep.
        let empty_intents: Vec<Intent> = vec![];
        let req2 = RunRequest {
            run_id: "run_2",
            requested_at: "2025-01-01T00:05:00.000Z",
            active_user_intents: &empty_intents,
            ..req1
        };
        let r2 = ctrl.run(&req2, &mut next_pid, &mut next_did, &|_| false).unwrap();
        assert_eq!(r2.proposals.len(), 0);
        assert_eq!(ctrl.active_proposals("t1").len(), 0);
    }

    /// A proposal still referenced downstream (`is_in_use = true`) survives
    /// past its expiry.
    #[test]
    fn step2_keeps_expired_proposals_still_in_use() {
        let mut ctrl = MatchingRolloutController::new();
        let mut cfg = MatchingV2Config::default();
        cfg.proposal_lifetime_ms = 1_000;
        let intents = three_cycle();
        let asset_values = values();
        let mut pid = 0u64;
        let mut did = 0u64;
        let mut next_pid = || { pid += 1; format!("prop_{pid}") };
        let mut next_did = || { did += 1; format!("diff_{did}") };

        let req1 = RunRequest {
            tenant_id: "t1",
            run_id: "run_1",
            actor: &actor(),
            idempotency_key: "k1",
            requested_at: "2025-01-01T00:00:00.000Z",
            stored_asset_values: &asset_values,
            derived_asset_values: &HashMap::new(),
            request_asset_values: &HashMap::new(),
            active_user_intents: &intents,
            active_edge_intents: &[],
            replace_existing: false,
            max_proposals: 10,
            primary_enabled: false,
            canary_enabled: false,
            shadow_enabled: false,
            ts_shadow_enabled: false,
            force_bucket_v2: false,
            fallback_on_timeout: false,
            fallback_on_limited: false,
            rollback_reset: false,
            force_v2_error: false,
            force_v2_timeout: false,
            salt: "salt",
            config: &cfg,
            proposal_lifetime_ms: cfg.proposal_lifetime_ms,
        };
        ctrl.run(&req1, &mut next_pid, &mut next_did, &|_| false).unwrap();
        assert_eq!(ctrl.active_proposals("t1").len(), 1);

        let empty_intents: Vec<Intent> = vec![];
        let req2 = RunRequest {
            run_id: "run_2",
            requested_at: "2025-01-01T00:05:00.000Z",
            active_user_intents: &empty_intents,
            ..req1
        };
        ctrl.run(&req2, &mut next_pid, &mut next_did, &|_| true).unwrap();
        assert_eq!(ctrl.active_proposals("t1").len(), 1);
    }
}
