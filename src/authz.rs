//! Authorization gate (spec.md §4.3): `{operation_id, actor, auth} -> {ok} |
//! {error}`. This is a coarse allow/deny gate over actor *type*, independent
//! of the finer per-operation actor-shape guards in `dispatch.rs` (which
//! additionally check things like provider ownership).

use crate::dispatch::{Actor, ActorType, AuthContext};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;

/// Which actor types may call a given operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedActors {
    PartnerOnly,
    UserOnly,
    PartnerOrUser,
    Any,
}

impl AllowedActors {
    fn permits(&self, actor_type: ActorType) -> bool {
        match self {
            AllowedActors::PartnerOnly => actor_type == ActorType::Partner,
            AllowedActors::UserOnly => actor_type == ActorType::User,
            AllowedActors::PartnerOrUser => {
                matches!(actor_type, ActorType::Partner | ActorType::User)
            }
            AllowedActors::Any => true,
        }
    }
}

/// Static table of `operation_id -> allowed actor types`, populated once at
/// startup from the operation catalog (spec.md §1 lists every `operation_id`
/// under its owning `[MODULE]`).
pub struct AuthorizationGate {
    rules: HashMap<String, AllowedActors>,
    default_rule: AllowedActors,
}

impl AuthorizationGate {
    pub fn new(default_rule: AllowedActors) -> Self {
        Self {
            rules: HashMap::new(),
            default_rule,
        }
    }

    pub fn with_rule(mut self, operation_id: impl Into<String>, allowed: AllowedActors) -> Self {
        self.rules.insert(operation_id.into(), allowed);
        self
    }

    /// The standard operation catalog for this system: delegations are
    /// user-only, everything else defaults to partner-only except the
    /// explicitly user-or-partner read surfaces, matching the per-module
    /// actor requirements spec.md §4.3 lists.
    pub fn standard() -> Self {
        Self::new(AllowedActors::PartnerOnly)
            .with_rule("delegation.create", AllowedActors::UserOnly)
            .with_rule("delegation.revoke", AllowedActors::UserOnly)
            .with_rule("delegation.get", AllowedActors::UserOnly)
            .with_rule("delegation.list", AllowedActors::UserOnly)
            .with_rule("trust_safety.list_decisions", AllowedActors::PartnerOrUser)
            .with_rule("products.get_preference", AllowedActors::PartnerOrUser)
            .with_rule("products.set_preference", AllowedActors::PartnerOrUser)
    }

    pub fn authorize(
        &self,
        operation_id: &str,
        actor: &Actor,
        _auth: &AuthContext,
    ) -> CoreResult<()> {
        actor.validate_nonempty()?;
        let rule = self.rules.get(operation_id).unwrap_or(&self.default_rule);
        if !rule.permits(actor.actor_type) {
            return Err(CoreError::forbidden(format!(
                "actor_type_not_permitted_for_{operation_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AuthContext;

    #[test]
    fn delegation_create_requires_user_actor() {
        let gate = AuthorizationGate::standard();
        let partner = Actor::new(ActorType::Partner, "p1");
        let user = Actor::new(ActorType::User, "u1");
        let auth = AuthContext::default();
        assert!(gate
            .authorize("delegation.create", &partner, &auth)
            .is_err());
        assert!(gate.authorize("delegation.create", &user, &auth).is_ok());
    }

    #[test]
    fn unknown_operation_falls_back_to_default_rule() {
        let gate = AuthorizationGate::standard();
        let partner = Actor::new(ActorType::Partner, "p1");
        let auth = AuthContext::default();
        assert!(gate
            .authorize("liquidity.policy.evaluate", &partner, &auth)
            .is_ok());
    }

    #[test]
    fn empty_actor_id_is_rejected() {
        let gate = AuthorizationGate::standard();
        let actor = Actor::new(ActorType::Partner, "");
        let auth = AuthContext::default();
        assert!(gate.authorize("liquidity.policy.evaluate", &actor, &auth).is_err());
    }
}
