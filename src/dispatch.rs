//! Operation envelopes and the `authorize -> guardActorShape -> resolveTenant
//! -> withIdempotency(handler)` service dispatch pipeline (spec.md §3, §4.8).

use crate::authz::AuthorizationGate;
use crate::canonical::payload_hash_of;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::idempotency::IdempotencyRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Principal making a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Partner,
    Agent,
}

impl Actor {
    pub fn new(actor_type: ActorType, id: impl Into<String>) -> Self {
        Self {
            actor_type,
            id: id.into(),
        }
    }

    pub fn scope_key_material(&self) -> String {
        format!("{:?}:{}", self.actor_type, self.id)
    }

    pub fn validate_nonempty(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::constraint_violation("actor_id_empty"));
        }
        Ok(())
    }
}

/// Caller-supplied auth context. Token parsing/verification is out of scope
/// (spec.md §1); by the time it reaches this crate `auth` is already a
/// resolved bag of facts, optionally carrying a test-only clock override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    #[serde(default)]
    pub now_iso: Option<String>,
    #[serde(default)]
    pub claims: Value,
}

/// Universal mutating-call envelope (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope<T> {
    pub actor: Actor,
    #[serde(default)]
    pub auth: AuthContext,
    pub idempotency_key: String,
    pub request: T,
}

/// Successful operation envelope.
#[derive(Debug, Clone, Serialize)]
pub struct OkEnvelope<T> {
    pub correlation_id: String,
    #[serde(flatten)]
    pub body: T,
}

/// Failure envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrEnvelope {
    pub correlation_id: String,
    pub error: CoreError,
}

/// Result of a mutating dispatch: either replay metadata wrapping an inner
/// result, matching spec.md §4.8 ("writes return `{replayed, result:{ok,
/// body}}`").
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome<T> {
    pub replayed: bool,
    pub result: Result<OkEnvelope<T>, ErrEnvelope>,
}

/// Deterministic correlation id: stable for identical input where possible
/// (spec.md's S1 scenario expects `corr_delegation_del_1` for a delegation
/// create, i.e. derived from the domain id rather than randomly generated).
pub fn correlation_id_for(scope: &str, key: &str) -> String {
    format!("corr_{scope}_{key}")
}

/// Random correlation id for operations with no natural deterministic key.
pub fn random_correlation_id(scope: &str) -> String {
    format!("corr_{scope}_{}", Uuid::new_v4().simple())
}

/// Shared dispatch context threaded into every handler.
pub struct DispatchContext {
    pub authz: Arc<AuthorizationGate>,
    pub idempotency: Arc<IdempotencyRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl DispatchContext {
    pub fn new(
        authz: Arc<AuthorizationGate>,
        idempotency: Arc<IdempotencyRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authz,
            idempotency,
            clock,
        }
    }

    /// Resolve `now_iso`: explicit `auth.now_iso` wins, then the injected
    /// clock, matching the AUTHZ_NOW_ISO fallback chain described in spec.md
    /// §6 (the env var fallback itself lives in `Config`; callers that need
    /// it pass it through as part of `auth.now_iso` resolution upstream).
    pub fn resolve_now(&self, auth: &AuthContext) -> String {
        auth.now_iso.clone().unwrap_or_else(|| self.clock.now_iso())
    }

    /// Run a mutating operation through
    /// `authorize -> guardActorShape -> resolveTenant -> withIdempotency(handler)`.
    ///
    /// `subscope` disambiguates idempotency scopes that share an operation
    /// name across two different providers/tenants (spec.md §4.4).
    pub fn dispatch_write<Req: Serialize, Body: Serialize + for<'de> Deserialize<'de> + Clone>(
        &self,
        operation_id: &str,
        actor: &Actor,
        auth: &AuthContext,
        idempotency_key: &str,
        subscope: Option<&str>,
        request: &Req,
        guard_actor_shape: impl FnOnce(&Actor) -> CoreResult<()>,
        handler: impl FnOnce() -> CoreResult<(String, Body)>,
    ) -> WriteOutcome<Body> {
        if let Err(e) = self.authz.authorize(operation_id, actor, auth) {
            tracing::warn!(operation_id, actor_id = %actor.id, reason = ?e.reason_code(), "authorize rejected");
            return WriteOutcome {
                replayed: false,
                result: Err(ErrEnvelope {
                    correlation_id: random_correlation_id(operation_id),
                    error: e,
                }),
            };
        }
        if let Err(e) = guard_actor_shape(actor) {
            tracing::warn!(operation_id, actor_id = %actor.id, reason = ?e.reason_code(), "actor shape guard rejected");
            return WriteOutcome {
                replayed: false,
                result: Err(ErrEnvelope {
                    correlation_id: random_correlation_id(operation_id),
                    error: e,
                }),
            };
        }

        let payload_hash = match payload_hash_of(request) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(operation_id, "request payload not serializable: {e}");
                return WriteOutcome {
                    replayed: false,
                    result: Err(ErrEnvelope {
                        correlation_id: random_correlation_id(operation_id),
                        error: CoreError::constraint_violation(format!(
                            "request_not_serializable: {e}"
                        )),
                    }),
                }
            }
        };

        match self.idempotency.begin::<Body>(
            actor,
            operation_id,
            subscope,
            idempotency_key,
            &payload_hash,
        ) {
            crate::idempotency::BeginOutcome::Replay(body) => {
                let correlation_id = random_correlation_id(operation_id);
                tracing::info!(operation_id, correlation_id = %correlation_id, "idempotent replay");
                WriteOutcome {
                    replayed: true,
                    result: Ok(OkEnvelope {
                        correlation_id,
                        body,
                    }),
                }
            }
            crate::idempotency::BeginOutcome::Mismatch => {
                tracing::warn!(operation_id, idempotency_key, "idempotency key reused with a different payload");
                WriteOutcome {
                    replayed: false,
                    result: Err(ErrEnvelope {
                        correlation_id: random_correlation_id(operation_id),
                        error: CoreError::idempotency_mismatch(),
                    }),
                }
            }
            crate::idempotency::BeginOutcome::Run(scope_key) => match handler() {
                Ok((correlation_id, body)) => {
                    self.idempotency.commit(&scope_key, &body);
                    tracing::info!(operation_id, correlation_id = %correlation_id, "dispatch_write completed");
                    WriteOutcome {
                        replayed: false,
                        result: Ok(OkEnvelope {
                            correlation_id,
                            body,
                        }),
                    }
                }
                Err(e) => {
                    self.idempotency.abort(&scope_key);
                    let correlation_id = random_correlation_id(operation_id);
                    tracing::warn!(operation_id, correlation_id = %correlation_id, reason = ?e.reason_code(), "dispatch_write handler failed");
                    WriteOutcome {
                        replayed: false,
                        result: Err(ErrEnvelope {
                            correlation_id,
                            error: e,
                        }),
                    }
                }
            },
        }
    }

    /// Run a read-only operation: `authorize -> guardActorShape -> handler`,
    /// no idempotency scope involved.
    pub fn dispatch_read<Body: Serialize>(
        &self,
        operation_id: &str,
        actor: &Actor,
        auth: &AuthContext,
        guard_actor_shape: impl FnOnce(&Actor) -> CoreResult<()>,
        handler: impl FnOnce() -> CoreResult<(String, Body)>,
    ) -> Result<OkEnvelope<Body>, ErrEnvelope> {
        self.authz
            .authorize(operation_id, actor, auth)
            .map_err(|e| {
                tracing::warn!(operation_id, actor_id = %actor.id, reason = ?e.reason_code(), "authorize rejected");
                ErrEnvelope {
                    correlation_id: random_correlation_id(operation_id),
                    error: e,
                }
            })?;
        guard_actor_shape(actor).map_err(|e| {
            tracing::warn!(operation_id, actor_id = %actor.id, reason = ?e.reason_code(), "actor shape guard rejected");
            ErrEnvelope {
                correlation_id: random_correlation_id(operation_id),
                error: e,
            }
        })?;
        match handler() {
            Ok((correlation_id, body)) => {
                tracing::info!(operation_id, correlation_id = %correlation_id, "dispatch_read completed");
                Ok(OkEnvelope {
                    correlation_id,
                    body,
                })
            }
            Err(e) => {
                let correlation_id = random_correlation_id(operation_id);
                tracing::warn!(operation_id, correlation_id = %correlation_id, reason = ?e.reason_code(), "dispatch_read handler failed");
                Err(ErrEnvelope {
                    correlation_id,
                    error: e,
                })
            }
        }
    }
}

/// Common actor-shape guards (spec.md §4.3).
pub fn require_partner(actor: &Actor) -> CoreResult<()> {
    actor.validate_nonempty()?;
    if actor.actor_type != ActorType::Partner {
        return Err(CoreError::forbidden("actor_must_be_partner"));
    }
    Ok(())
}

pub fn require_user(actor: &Actor) -> CoreResult<()> {
    actor.validate_nonempty()?;
    if actor.actor_type != ActorType::User {
        return Err(CoreError::forbidden("actor_must_be_user"));
    }
    Ok(())
}

pub fn require_any_actor(actor: &Actor) -> CoreResult<()> {
    actor.validate_nonempty()
}

pub fn require_provider_owner(actor: &Actor, owner_actor: &Actor) -> CoreResult<()> {
    require_partner(actor)?;
    if actor != owner_actor {
        return Err(CoreError::forbidden("liquidity_provider_actor_mismatch"));
    }
    Ok(())
}
