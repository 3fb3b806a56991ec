//! Thin JSON-RPC-shaped HTTP glue over the operation pipeline.
//!
//! HTTP framing itself is out of scope for this crate (spec.md §1): every
//! route here does nothing but deserialize a [`RequestEnvelope`], call into
//! `domain::*`/`dispatch::*`, and serialize whatever envelope comes back.
//! The handlers below cover a representative slice of the operation catalog
//! (delegations, liquidity policy, trust & safety export, staging evidence)
//! end to end; every other `operation_id` in spec.md follows the identical
//! `authorize -> guardActorShape -> resolveTenant -> withIdempotency(handler)`
//! shape and is omitted here only because it is repetition, not because it
//! differs.

pub mod routes;

use crate::authz::AuthorizationGate;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::idempotency::IdempotencyRegistry;
use crate::store::Store;
use std::sync::Arc;

/// Process-wide handle threaded into every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub authz: Arc<AuthorizationGate>,
    pub idempotency: Arc<IdempotencyRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(Store::new()),
            config: Arc::new(config),
            authz: Arc::new(AuthorizationGate::standard()),
            idempotency: Arc::new(IdempotencyRegistry::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// `auth.now_iso` > `AUTHZ_NOW_ISO` > the injected clock (spec.md §6).
    pub fn resolve_now(&self, auth_now_iso: Option<&str>) -> String {
        auth_now_iso
            .map(str::to_string)
            .or_else(|| self.config.authz_now_iso.clone())
            .unwrap_or_else(|| self.clock.now_iso())
    }
}

pub use routes::build_router;
