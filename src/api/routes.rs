//! Representative `operation_id` routes.
//!
//! Every handler follows the same shape:
//! 1. pull a [`crate::dispatch::DispatchContext`] out of [`AppState`],
//! 2. deserialize the request envelope,
//! 3. call `dispatch_write`/`dispatch_read` with the actor-shape guard and a
//!    closure that locks the store once and drives the domain module,
//! 4. return the resulting envelope as JSON with the matching HTTP status.

use super::AppState;
use crate::dispatch::{
    correlation_id_for, random_correlation_id, require_partner, require_provider_owner,
    require_user, Actor, AuthContext, DispatchContext, ErrEnvelope, OkEnvelope, WriteOutcome,
};
use crate::domain::delegation::CreateDelegationRequest;
use crate::domain::liquidity::policy::{EvaluationInput, EvaluationResult, UpsertPolicyRequest};
use crate::error::CoreError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for read-only operations: no `idempotency_key`, since nothing is
/// frozen or replayed for a pure read (spec.md §4.4 only scopes mutations).
#[derive(Debug, Clone, Deserialize)]
pub struct ReadEnvelope<T> {
    pub actor: Actor,
    #[serde(default)]
    pub auth: AuthContext,
    pub request: T,
}

fn dispatch_context(state: &AppState) -> DispatchContext {
    DispatchContext::new(
        state.authz.clone(),
        state.idempotency.clone(),
        state.clock.clone(),
    )
}

fn status_for(error: &CoreError) -> StatusCode {
    use crate::error::ErrorCode::*;
    match error.code {
        ConstraintViolation => StatusCode::BAD_REQUEST,
        Forbidden => StatusCode::FORBIDDEN,
        NotFound => StatusCode::NOT_FOUND,
        Conflict => StatusCode::CONFLICT,
        IdempotencyKeyReusePayloadMismatch => StatusCode::CONFLICT,
    }
}

fn write_response<T: Serialize>(outcome: WriteOutcome<T>) -> Response {
    let status = match &outcome.result {
        Ok(_) => StatusCode::OK,
        Err(err) => status_for(&err.error),
    };
    (status, Json(outcome)).into_response()
}

fn read_response<T: Serialize>(result: Result<OkEnvelope<T>, ErrEnvelope>) -> Response {
    match result {
        Ok(ok) => (StatusCode::OK, Json(ok)).into_response(),
        Err(err) => (status_for(&err.error), Json(err)).into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct DelegationBody {
    delegation: crate::domain::delegation::Delegation,
}

async fn delegation_create(
    State(state): State<AppState>,
    Json(envelope): Json<crate::dispatch::RequestEnvelope<CreateDelegationRequest>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let delegation_id = envelope.request.delegation_id.clone();
    let outcome = ctx.dispatch_write::<_, DelegationBody>(
        "delegation.create",
        &envelope.actor,
        &envelope.auth,
        &envelope.idempotency_key,
        None,
        &envelope.request,
        require_user,
        || {
            let mut state_guard = state.store.state.lock();
            let delegation =
                state_guard
                    .delegations
                    .create(&mut state_guard.ledger, &envelope.actor, &envelope.request, &now_iso)?;
            Ok((
                correlation_id_for("delegation", &delegation_id),
                DelegationBody { delegation },
            ))
        },
    );
    write_response(outcome)
}

#[derive(Debug, Deserialize)]
struct DelegationIdRequest {
    delegation_id: String,
}

async fn delegation_get(
    State(state): State<AppState>,
    Json(envelope): Json<ReadEnvelope<DelegationIdRequest>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let result = ctx.dispatch_read(
        "delegation.get",
        &envelope.actor,
        &envelope.auth,
        require_user,
        || {
            let state_guard = state.store.state.lock();
            let delegation = state_guard
                .delegations
                .get(&envelope.actor, &envelope.request.delegation_id)?;
            Ok((
                correlation_id_for("delegation", &envelope.request.delegation_id),
                DelegationBody { delegation },
            ))
        },
    );
    read_response(result)
}

async fn delegation_revoke(
    State(state): State<AppState>,
    Json(envelope): Json<crate::dispatch::RequestEnvelope<DelegationIdRequest>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let delegation_id = envelope.request.delegation_id.clone();
    let outcome = ctx.dispatch_write::<_, DelegationBody>(
        "delegation.revoke",
        &envelope.actor,
        &envelope.auth,
        &envelope.idempotency_key,
        None,
        &envelope.request,
        require_user,
        || {
            let mut state_guard = state.store.state.lock();
            let delegation = state_guard.delegations.revoke(
                &mut state_guard.ledger,
                &envelope.actor,
                &envelope.request.delegation_id,
                &now_iso,
            )?;
            Ok((correlation_id_for("delegation", &delegation_id), DelegationBody { delegation }))
        },
    );
    write_response(outcome)
}

async fn delegation_list(
    State(state): State<AppState>,
    Json(envelope): Json<ReadEnvelope<Value>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let result = ctx.dispatch_read(
        "delegation.list",
        &envelope.actor,
        &envelope.auth,
        require_user,
        || {
            let state_guard = state.store.state.lock();
            let delegations = state_guard.delegations.list(&envelope.actor);
            Ok((
                random_correlation_id("delegation_list"),
                serde_json::json!({ "delegations": delegations }),
            ))
        },
    );
    read_response(result)
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderScopedRequest<T> {
    provider_id: String,
    #[serde(flatten)]
    request: T,
}

fn load_owned_provider(
    state: &AppState,
    actor: &Actor,
    provider_id: &str,
) -> Result<(), CoreError> {
    let state_guard = state.store.state.lock();
    let provider = state_guard
        .liquidity_providers
        .get(provider_id)
        .ok_or_else(|| CoreError::not_found("liquidity_provider_not_found"))?;
    require_provider_owner(actor, &provider.owner_actor)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct PolicyBody {
    policy: crate::domain::liquidity::policy::LiquidityPolicy,
}

async fn liquidity_policy_upsert(
    State(state): State<AppState>,
    Json(envelope): Json<crate::dispatch::RequestEnvelope<ProviderScopedRequest<UpsertPolicyRequest>>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let provider_id = envelope.request.provider_id.clone();
    let provider_check = provider_id.clone();
    let outcome = ctx.dispatch_write::<_, PolicyBody>(
        "liquidity_policy.upsert",
        &envelope.actor,
        &envelope.auth,
        &envelope.idempotency_key,
        Some(&provider_id),
        &envelope.request,
        |actor| {
            require_partner(actor)?;
            load_owned_provider(&state, actor, &provider_check)
        },
        || {
            let mut state_guard = state.store.state.lock();
            let policy = state_guard
                .liquidity_policy
                .upsert(&provider_id, &envelope.request.request)?;
            Ok((random_correlation_id("liquidity_policy"), PolicyBody { policy }))
        },
    );
    write_response(outcome)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct EvaluationBody {
    result: EvaluationResult,
}

async fn liquidity_policy_evaluate(
    State(state): State<AppState>,
    Json(envelope): Json<crate::dispatch::RequestEnvelope<ProviderScopedRequest<EvaluationInput>>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let provider_id = envelope.request.provider_id.clone();
    let provider_check = provider_id.clone();
    let outcome = ctx.dispatch_write::<_, EvaluationBody>(
        "liquidity_policy.evaluate",
        &envelope.actor,
        &envelope.auth,
        &envelope.idempotency_key,
        Some(&provider_id),
        &envelope.request,
        |actor| {
            require_partner(actor)?;
            load_owned_provider(&state, actor, &provider_check)
        },
        || {
            let day_bucket = now_iso.get(0..10).unwrap_or(&now_iso).to_string();
            let eval_id = crate::clock::deterministic_id(
                "eval",
                &crate::canonical::payload_hash_of(&envelope.request.request)
                    .unwrap_or_default(),
            );
            let mut state_guard = state.store.state.lock();
            let result = state_guard.liquidity_policy.record_evaluation(
                &mut state_guard.ledger,
                &provider_id,
                &day_bucket,
                &eval_id,
                &now_iso,
                &envelope.request.request,
            )?;
            Ok((random_correlation_id("liquidity_policy_evaluation"), EvaluationBody { result }))
        },
    );
    write_response(outcome)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct TrustSafetyExportBody {
    entries: Vec<Value>,
    next_cursor: Option<String>,
    total_filtered: usize,
}

#[derive(Debug, Deserialize, Default)]
struct ExportQuery {
    #[serde(default)]
    cursor_after: Option<String>,
    #[serde(default)]
    attestation_after: Option<String>,
    #[serde(default)]
    checkpoint_after: Option<String>,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    redact: bool,
}

async fn trust_safety_export(
    State(state): State<AppState>,
    Json(envelope): Json<ReadEnvelope<ExportQuery>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let result = ctx.dispatch_read(
        "trust_safety.export",
        &envelope.actor,
        &envelope.auth,
        require_partner,
        || {
            let tenant = format!("{:?}:{}", envelope.actor.actor_type, envelope.actor.id);
            let mut state_guard = state.store.state.lock();
            let now_ms = crate::clock::parse_strict_iso8601(&now_iso)
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_default();
            let retention_cutoff_ms = now_ms
                - state.config.trust_safety_export.retention_days as i64 * 86_400_000;
            let checkpoint_retention_cutoff_ms = now_ms
                - state.config.trust_safety_export.checkpoint_retention_days as i64 * 86_400_000;
            let previous_chain_hash = state_guard.chain_hash(&tenant, "trust_safety_decision");
            let continuation = crate::export::ContinuationRequest {
                cursor_after: envelope.request.cursor_after.as_deref(),
                attestation_after: envelope.request.attestation_after.as_deref(),
                checkpoint_after: envelope.request.checkpoint_after.as_deref(),
            };
            let page = state_guard.trust_safety.export(
                &state_guard.ledger,
                &mut state_guard.checkpoints,
                &tenant,
                &continuation,
                envelope.request.page_size.unwrap_or(50),
                Some(retention_cutoff_ms),
                Some(checkpoint_retention_cutoff_ms),
                &previous_chain_hash,
                now_ms,
                envelope.request.redact,
                &state.config.attestation_signer,
            )?;
            let chain_hash = page.attestation.chain_hash.clone();
            let total_filtered = page.entries.len();
            let next_cursor = page.checkpoint.next_cursor.clone();
            let entries: Vec<Value> = page.entries.iter().map(|e| e.payload.clone()).collect();
            state_guard.set_chain_hash(&tenant, "trust_safety_decision", chain_hash);
            Ok((
                random_correlation_id("trust_safety_export"),
                TrustSafetyExportBody { entries, next_cursor, total_filtered },
            ))
        },
    );
    read_response(result)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct LiquidityPolicyExportBody {
    entries: Vec<Value>,
    next_cursor: Option<String>,
    total_filtered: usize,
}

async fn liquidity_policy_export(
    State(state): State<AppState>,
    Json(envelope): Json<ReadEnvelope<ProviderScopedRequest<ExportQuery>>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let provider_id = envelope.request.provider_id.clone();
    let result = ctx.dispatch_read(
        "liquidity_policy.export",
        &envelope.actor,
        &envelope.auth,
        |actor| {
            require_partner(actor)?;
            load_owned_provider(&state, actor, &provider_id)
        },
        || {
            let mut state_guard = state.store.state.lock();
            let now_ms = crate::clock::parse_strict_iso8601(&now_iso)
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_default();
            let retention_cutoff_ms = now_ms
                - state.config.liquidity_policy_audit_export.retention_days as i64 * 86_400_000;
            let checkpoint_retention_cutoff_ms = now_ms
                - state.config.liquidity_policy_audit_export.checkpoint_retention_days as i64
                    * 86_400_000;
            let previous_chain_hash =
                state_guard.chain_hash(&provider_id, crate::domain::liquidity::policy::LEDGER_KIND);
            let continuation = crate::export::ContinuationRequest {
                cursor_after: envelope.request.request.cursor_after.as_deref(),
                attestation_after: envelope.request.request.attestation_after.as_deref(),
                checkpoint_after: envelope.request.request.checkpoint_after.as_deref(),
            };
            let page = state_guard.liquidity_policy.export(
                &state_guard.ledger,
                &mut state_guard.checkpoints,
                &provider_id,
                &continuation,
                envelope.request.request.page_size.unwrap_or(50),
                Some(retention_cutoff_ms),
                Some(checkpoint_retention_cutoff_ms),
                &previous_chain_hash,
                now_ms,
                &state.config.attestation_signer,
            )?;
            let chain_hash = page.attestation.chain_hash.clone();
            let total_filtered = page.entries.len();
            let next_cursor = page.checkpoint.next_cursor.clone();
            let entries: Vec<Value> = page.entries.iter().map(|e| e.payload.clone()).collect();
            state_guard.set_chain_hash(
                &provider_id,
                crate::domain::liquidity::policy::LEDGER_KIND,
                chain_hash,
            );
            Ok((
                random_correlation_id("liquidity_policy_export"),
                LiquidityPolicyExportBody { entries, next_cursor, total_filtered },
            ))
        },
    );
    read_response(result)
}

#[derive(Debug, Deserialize)]
struct StagingEvidenceSubmitRequest {
    bundle_id: String,
    milestone: String,
    manifest: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct StagingEvidenceBody {
    bundle: crate::domain::staging_evidence::StagingEvidenceBundle,
}

async fn staging_evidence_submit(
    State(state): State<AppState>,
    Json(envelope): Json<crate::dispatch::RequestEnvelope<StagingEvidenceSubmitRequest>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let bundle_id = envelope.request.bundle_id.clone();
    let outcome = ctx.dispatch_write::<_, StagingEvidenceBody>(
        "staging_evidence.submit",
        &envelope.actor,
        &envelope.auth,
        &envelope.idempotency_key,
        None,
        &envelope.request,
        require_partner,
        || {
            let now_ms = crate::clock::parse_strict_iso8601(&now_iso)
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_default();
            let mut state_guard = state.store.state.lock();
            let bundle = state_guard.staging_evidence.submit(
                &mut state_guard.ledger,
                &bundle_id,
                &envelope.actor.id,
                &envelope.request.milestone,
                envelope.request.manifest.clone(),
                &now_iso,
                now_ms,
            )?;
            Ok((correlation_id_for("staging_evidence", &bundle_id), StagingEvidenceBody { bundle }))
        },
    );
    write_response(outcome)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct StagingEvidenceExportBody {
    entries: Vec<Value>,
    next_cursor: Option<String>,
    total_filtered: usize,
}

async fn staging_evidence_export(
    State(state): State<AppState>,
    Json(envelope): Json<ReadEnvelope<ExportQuery>>,
) -> Response {
    let ctx = dispatch_context(&state);
    let now_iso = state.resolve_now(envelope.auth.now_iso.as_deref());
    let result = ctx.dispatch_read(
        "staging_evidence.export",
        &envelope.actor,
        &envelope.auth,
        require_partner,
        || {
            let partner_id = envelope.actor.id.clone();
            let mut state_guard = state.store.state.lock();
            let now_ms = crate::clock::parse_strict_iso8601(&now_iso)
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_default();
            let retention_cutoff_ms = now_ms
                - state.config.staging_evidence_export.retention_days as i64 * 86_400_000;
            let checkpoint_retention_cutoff_ms = now_ms
                - state.config.staging_evidence_export.checkpoint_retention_days as i64 * 86_400_000;
            let previous_chain_hash =
                state_guard.chain_hash(&partner_id, crate::domain::staging_evidence::LEDGER_KIND);
            let continuation = crate::export::ContinuationRequest {
                cursor_after: envelope.request.cursor_after.as_deref(),
                attestation_after: envelope.request.attestation_after.as_deref(),
                checkpoint_after: envelope.request.checkpoint_after.as_deref(),
            };
            let page = state_guard.staging_evidence.export(
                &state_guard.ledger,
                &mut state_guard.checkpoints,
                &partner_id,
                &continuation,
                envelope.request.page_size.unwrap_or(50),
                Some(retention_cutoff_ms),
                Some(checkpoint_retention_cutoff_ms),
                &previous_chain_hash,
                now_ms,
                &state.config.attestation_signer,
            )?;
            let chain_hash = page.attestation.chain_hash.clone();
            let total_filtered = page.entries.len();
            let next_cursor = page.checkpoint.next_cursor.clone();
            let entries: Vec<Value> = page.entries.iter().map(|e| e.payload.clone()).collect();
            state_guard.set_chain_hash(
                &partner_id,
                crate::domain::staging_evidence::LEDGER_KIND,
                chain_hash,
            );
            Ok((
                random_correlation_id("staging_evidence_export"),
                StagingEvidenceExportBody { entries, next_cursor, total_filtered },
            ))
        },
    );
    read_response(result)
}

/// Build the axum router. One POST route per `operation_id`, mirroring
/// spec.md §6's "one POST route per `operation_id`" plan; this is glue, not
/// the system's reason to exist, so only a representative slice is wired.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ops/delegation.create", post(delegation_create))
        .route("/ops/delegation.get", post(delegation_get))
        .route("/ops/delegation.revoke", post(delegation_revoke))
        .route("/ops/delegation.list", post(delegation_list))
        .route("/ops/liquidity_policy.upsert", post(liquidity_policy_upsert))
        .route("/ops/liquidity_policy.evaluate", post(liquidity_policy_evaluate))
        .route("/ops/liquidity_policy.export", post(liquidity_policy_export))
        .route("/ops/trust_safety.export", post(trust_safety_export))
        .route("/ops/staging_evidence.submit", post(staging_evidence_submit))
        .route("/ops/staging_evidence.export", post(staging_evidence_export))
        .route("/health", axum::routing::get(|| async { "ok" }))
        .with_state(state)
}
