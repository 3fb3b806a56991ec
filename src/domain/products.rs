//! Product projections & notifications (spec.md §3, §4.11): read-only
//! derivations over proposals, timelines, receipts, and intents, filtered by
//! actor-visibility, plus per-actor notification preferences with quiet
//! hours and per-category opt-in.

use crate::dispatch::Actor;
use crate::domain::matching::Proposal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Any record that can be filtered by actor visibility.
pub trait Visible {
    fn visible_actors(&self) -> &[Actor];
}

impl Visible for Proposal {
    fn visible_actors(&self) -> &[Actor] {
        &self.visible_to
    }
}

pub fn filter_visible<'a, T: Visible>(actor: &Actor, items: &'a [T]) -> Vec<&'a T> {
    items
        .iter()
        .filter(|item| item.visible_actors().contains(actor))
        .collect()
}

/// Read-only projection over marketplace matching proposals, filtered by
/// actor-visibility rules (spec.md:158). Timelines, receipts, and intents are
/// not yet modeled as standalone records in this core (only proposals are,
/// via `domain::matching`); this projection is the one the rest of the
/// system's read surface composes with as those records are added.
pub fn visible_proposals<'a>(actor: &Actor, proposals: &'a [Proposal]) -> Vec<&'a Proposal> {
    filter_visible(actor, proposals)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub actor: Actor,
    /// `(start_hour_utc, end_hour_utc)`, each `0..24`; wraps past midnight
    /// when `start > end` (e.g. `(22, 6)`).
    #[serde(default)]
    pub quiet_hours: Option<(u8, u8)>,
    #[serde(default)]
    pub category_opt_in: HashMap<String, bool>,
}

impl NotificationPreference {
    fn default_for(actor: &Actor) -> Self {
        Self {
            actor: actor.clone(),
            quiet_hours: None,
            category_opt_in: HashMap::new(),
        }
    }

    fn in_quiet_hours(&self, hour_utc: u8) -> bool {
        match self.quiet_hours {
            None => false,
            Some((start, end)) if start <= end => hour_utc >= start && hour_utc < end,
            Some((start, end)) => hour_utc >= start || hour_utc < end,
        }
    }

    pub fn should_notify(&self, category: &str, hour_utc: u8) -> bool {
        if self.in_quiet_hours(hour_utc) {
            return false;
        }
        *self.category_opt_in.get(category).unwrap_or(&true)
    }
}

#[derive(Default)]
pub struct ProductsStore {
    pub preferences: HashMap<String, NotificationPreference>,
}

impl ProductsStore {
    pub fn set_preference(
        &mut self,
        actor: &Actor,
        quiet_hours: Option<(u8, u8)>,
        category_opt_in: HashMap<String, bool>,
    ) -> NotificationPreference {
        let pref = NotificationPreference {
            actor: actor.clone(),
            quiet_hours,
            category_opt_in,
        };
        self.preferences
            .insert(actor.scope_key_material(), pref.clone());
        pref
    }

    pub fn get_preference(&self, actor: &Actor) -> NotificationPreference {
        self.preferences
            .get(&actor.scope_key_material())
            .cloned()
            .unwrap_or_else(|| NotificationPreference::default_for(actor))
    }

    pub fn should_notify(&self, actor: &Actor, category: &str, hour_utc: u8) -> bool {
        self.get_preference(actor).should_notify(category, hour_utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ActorType;

    fn user(id: &str) -> Actor {
        Actor::new(ActorType::User, id)
    }

    fn partner(id: &str) -> Actor {
        Actor::new(ActorType::Partner, id)
    }

    fn proposal(id: &str, visible_to: Vec<Actor>) -> Proposal {
        Proposal {
            proposal_id: id.to_string(),
            run_id: "run_1".to_string(),
            cycle: vec!["i1".to_string(), "i2".to_string()],
            cycle_key: "i1>i2".to_string(),
            confidence_score: 0.9,
            expires_at: None,
            engine: crate::domain::matching::EngineTag::V1,
            visible_to,
        }
    }

    #[test]
    fn filter_visible_scopes_by_actor() {
        let proposals = vec![
            proposal("p1", vec![partner("lp1")]),
            proposal("p2", vec![partner("lp2")]),
        ];
        let visible = filter_visible(&partner("lp1"), &proposals);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].proposal_id, "p1");
    }

    #[test]
    fn visible_proposals_excludes_proposals_for_other_actors() {
        let proposals = vec![
            proposal("p1", vec![partner("lp1")]),
            proposal("p2", vec![partner("lp2")]),
            proposal("p3", vec![partner("lp1"), partner("lp2")]),
        ];
        let visible = visible_proposals(&partner("lp2"), &proposals);
        assert_eq!(
            visible.iter().map(|p| p.proposal_id.as_str()).collect::<Vec<_>>(),
            vec!["p2", "p3"]
        );
        assert!(visible_proposals(&user("u1"), &proposals).is_empty());
    }

    #[test]
    fn default_preference_notifies_everything() {
        let store = ProductsStore::default();
        assert!(store.should_notify(&user("u1"), "settlement", 3));
    }

    #[test]
    fn quiet_hours_wrap_past_midnight() {
        let mut store = ProductsStore::default();
        store.set_preference(&user("u1"), Some((22, 6)), HashMap::new());
        assert!(!store.should_notify(&user("u1"), "settlement", 23));
        assert!(!store.should_notify(&user("u1"), "settlement", 2));
        assert!(store.should_notify(&user("u1"), "settlement", 12));
    }

    #[test]
    fn category_opt_out_is_respected() {
        let mut store = ProductsStore::default();
        let mut opt_in = HashMap::new();
        opt_in.insert("marketing".to_string(), false);
        store.set_preference(&user("u1"), None, opt_in);
        assert!(!store.should_notify(&user("u1"), "marketing", 12));
        assert!(store.should_notify(&user("u1"), "settlement", 12));
    }
}
