//! Typed process configuration (spec.md §6).
//!
//! Loaded once at start-up via [`Config::from_env`], mirroring the teacher's
//! `models::Config::from_env` (dotenv for local `.env`, `std::env::var` reads
//! with sane defaults). Every knob spec.md §6 lists gets one field with one
//! stable effect; retention windows are clamped to `[1, 3650]` days exactly
//! as the spec requires. Tests override by constructing a `Config` directly
//! rather than touching the process environment.

use crate::attestation::AttestationSigner;
use std::env;

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_retention_days(name: &str, default: u32) -> u32 {
    env_u32(name, default).clamp(1, 3650)
}

/// Retention configuration for one export contract: how long entries stay
/// visible (`retention_days`) and how long issued checkpoints stay resumable
/// (`checkpoint_retention_days`).
#[derive(Debug, Clone, Copy)]
pub struct ExportRetention {
    pub retention_days: u32,
    pub checkpoint_retention_days: u32,
}

/// Matching v2 shadow/canary/primary tunables (spec.md §4.10, §6).
#[derive(Debug, Clone, Copy)]
pub struct MatchingV2Config {
    pub shadow_enabled: bool,
    pub min_cycle_length: u32,
    pub max_cycle_length: u32,
    pub max_cycles_explored: u32,
    pub timeout_ms: u64,
    pub rollout_bps: u32,
    pub rollback_window_runs: usize,
    pub max_shadow_diffs: usize,
    pub max_ts_shadow_diffs: usize,
    /// How long a freshly persisted marketplace proposal stays live before a
    /// later run's step 2 is eligible to expire it (spec.md §4.10 step 2).
    pub proposal_lifetime_ms: i64,

    /// Fraction (`0.0..=1.0`) of sampled canary-selected runs that must
    /// report an error before the rollback latch trips. Kept as a config
    /// input rather than a hard-coded constant (spec.md §9 open question).
    pub canary_error_rate_threshold: f64,
    pub canary_timeout_rate_threshold: f64,
    pub canary_limited_rate_threshold: f64,
    pub canary_negative_delta_rate_threshold: f64,
}

impl Default for MatchingV2Config {
    fn default() -> Self {
        Self {
            shadow_enabled: false,
            min_cycle_length: 2,
            max_cycle_length: 3,
            max_cycles_explored: 5_000,
            timeout_ms: 250,
            rollout_bps: 0,
            rollback_window_runs: 20,
            max_shadow_diffs: 200,
            max_ts_shadow_diffs: 200,
            proposal_lifetime_ms: 900_000,
            canary_error_rate_threshold: 0.2,
            canary_timeout_rate_threshold: 0.2,
            canary_limited_rate_threshold: 0.2,
            canary_negative_delta_rate_threshold: 0.5,
        }
    }
}

impl MatchingV2Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            shadow_enabled: env_flag("MATCHING_V2_SHADOW", default.shadow_enabled),
            min_cycle_length: env_u32("MATCHING_V2_MIN_CYCLE_LENGTH", default.min_cycle_length),
            max_cycle_length: env_u32("MATCHING_V2_MAX_CYCLE_LENGTH", default.max_cycle_length),
            max_cycles_explored: env_u32(
                "MATCHING_V2_MAX_CYCLES_EXPLORED",
                default.max_cycles_explored,
            ),
            timeout_ms: env_u64("MATCHING_V2_TIMEOUT_MS", default.timeout_ms),
            rollout_bps: env_u32("MATCHING_V2_ROLLOUT_BPS", default.rollout_bps),
            rollback_window_runs: env_u32(
                "MATCHING_V2_ROLLBACK_WINDOW_RUNS",
                default.rollback_window_runs as u32,
            ) as usize,
            max_shadow_diffs: default.max_shadow_diffs,
            max_ts_shadow_diffs: default.max_ts_shadow_diffs,
            proposal_lifetime_ms: env_u64(
                "MATCHING_V2_PROPOSAL_LIFETIME_MS",
                default.proposal_lifetime_ms as u64,
            ) as i64,
            canary_error_rate_threshold: env_f64(
                "MATCHING_V2_CANARY_ERROR_RATE_THRESHOLD",
                default.canary_error_rate_threshold,
            ),
            canary_timeout_rate_threshold: env_f64(
                "MATCHING_V2_CANARY_TIMEOUT_RATE_THRESHOLD",
                default.canary_timeout_rate_threshold,
            ),
            canary_limited_rate_threshold: env_f64(
                "MATCHING_V2_CANARY_LIMITED_RATE_THRESHOLD",
                default.canary_limited_rate_threshold,
            ),
            canary_negative_delta_rate_threshold: env_f64(
                "MATCHING_V2_CANARY_NEGATIVE_DELTA_RATE_THRESHOLD",
                default.canary_negative_delta_rate_threshold,
            ),
        }
    }
}

/// Process-wide configuration, loaded once at start-up (spec.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    /// `INTEGRATION_ENABLED` — required for `constrained_auto` execution in a
    /// restricted adapter context.
    pub integration_enabled: bool,
    /// `AUTHZ_NOW_ISO` — fallback wall clock when neither `auth.now_iso` nor
    /// `query.now_iso` is present.
    pub authz_now_iso: Option<String>,

    pub inclusion_proof_export: ExportRetention,
    pub inclusion_proof_export_checkpoint_enforce: bool,
    pub transparency_log_export: ExportRetention,
    pub transparency_log_export_checkpoint_enforce: bool,
    pub metrics_export: ExportRetention,
    pub liquidity_policy_audit_export: ExportRetention,
    pub liquidity_execution_export: ExportRetention,
    pub partner_liquidity_provider_rollout_export: ExportRetention,
    pub trust_safety_export: ExportRetention,
    pub staging_evidence_export: ExportRetention,

    pub matching_v2: MatchingV2Config,

    /// `ATTESTATION_KEY_ID` / `ATTESTATION_SIGNING_SECRET` — the deterministic
    /// stand-in signer every `*.export` attestation is signed with
    /// (spec.md §3, §4.6; real crypto-scheme analysis is out of scope per
    /// spec.md §1 Non-goals).
    pub attestation_signer: AttestationSigner,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            integration_enabled: env_flag("INTEGRATION_ENABLED", false),
            authz_now_iso: env::var("AUTHZ_NOW_ISO").ok(),

            inclusion_proof_export: ExportRetention {
                retention_days: env_retention_days(
                    "INCLUSION_PROOF_EXPORT_RETENTION_DAYS",
                    7,
                ),
                checkpoint_retention_days: env_retention_days(
                    "INCLUSION_PROOF_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },
            inclusion_proof_export_checkpoint_enforce: env_flag(
                "INCLUSION_PROOF_EXPORT_CHECKPOINT_ENFORCE",
                false,
            ),
            transparency_log_export: ExportRetention {
                retention_days: env_retention_days(
                    "TRANSPARENCY_LOG_EXPORT_RETENTION_DAYS",
                    7,
                ),
                checkpoint_retention_days: env_retention_days(
                    "TRANSPARENCY_LOG_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },
            transparency_log_export_checkpoint_enforce: env_flag(
                "TRANSPARENCY_LOG_EXPORT_CHECKPOINT_ENFORCE",
                false,
            ),
            metrics_export: ExportRetention {
                retention_days: env_retention_days("METRICS_EXPORT_RETENTION_DAYS", 180),
                checkpoint_retention_days: env_retention_days(
                    "METRICS_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    180,
                ),
            },
            liquidity_policy_audit_export: ExportRetention {
                retention_days: env_retention_days(
                    "LIQUIDITY_POLICY_AUDIT_EXPORT_RETENTION_DAYS",
                    30,
                ),
                checkpoint_retention_days: env_retention_days(
                    "LIQUIDITY_POLICY_AUDIT_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },
            liquidity_execution_export: ExportRetention {
                retention_days: env_retention_days(
                    "LIQUIDITY_EXECUTION_EXPORT_RETENTION_DAYS",
                    30,
                ),
                checkpoint_retention_days: env_retention_days(
                    "LIQUIDITY_EXECUTION_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },
            partner_liquidity_provider_rollout_export: ExportRetention {
                retention_days: env_retention_days(
                    "PARTNER_LIQUIDITY_PROVIDER_ROLLOUT_EXPORT_RETENTION_DAYS",
                    30,
                ),
                checkpoint_retention_days: env_retention_days(
                    "PARTNER_LIQUIDITY_PROVIDER_ROLLOUT_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },
            trust_safety_export: ExportRetention {
                retention_days: env_retention_days("TRUST_SAFETY_EXPORT_RETENTION_DAYS", 30),
                checkpoint_retention_days: env_retention_days(
                    "TRUST_SAFETY_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },
            staging_evidence_export: ExportRetention {
                retention_days: env_retention_days("STAGING_EVIDENCE_EXPORT_RETENTION_DAYS", 30),
                checkpoint_retention_days: env_retention_days(
                    "STAGING_EVIDENCE_EXPORT_CHECKPOINT_RETENTION_DAYS",
                    30,
                ),
            },

            matching_v2: MatchingV2Config::from_env(),

            attestation_signer: AttestationSigner::new(
                env::var("ATTESTATION_KEY_ID").unwrap_or_else(|_| "marketcore-default".into()),
                env::var("ATTESTATION_SIGNING_SECRET")
                    .unwrap_or_else(|_| "marketcore-dev-signing-secret".into()),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            integration_enabled: false,
            authz_now_iso: None,
            inclusion_proof_export: ExportRetention {
                retention_days: 7,
                checkpoint_retention_days: 30,
            },
            inclusion_proof_export_checkpoint_enforce: false,
            transparency_log_export: ExportRetention {
                retention_days: 7,
                checkpoint_retention_days: 30,
            },
            transparency_log_export_checkpoint_enforce: false,
            metrics_export: ExportRetention {
                retention_days: 180,
                checkpoint_retention_days: 180,
            },
            liquidity_policy_audit_export: ExportRetention {
                retention_days: 30,
                checkpoint_retention_days: 30,
            },
            liquidity_execution_export: ExportRetention {
                retention_days: 30,
                checkpoint_retention_days: 30,
            },
            partner_liquidity_provider_rollout_export: ExportRetention {
                retention_days: 30,
                checkpoint_retention_days: 30,
            },
            trust_safety_export: ExportRetention {
                retention_days: 30,
                checkpoint_retention_days: 30,
            },
            staging_evidence_export: ExportRetention {
                retention_days: 30,
                checkpoint_retention_days: 30,
            },
            matching_v2: MatchingV2Config::default(),
            attestation_signer: AttestationSigner::new(
                "marketcore-default",
                "marketcore-dev-signing-secret",
            ),
        }
    }
}
