//! Generic append-only, per-`(tenant, kind)`-scoped monotone ledger (spec.md
//! §4.5). Every domain module that needs a recorded history of entries
//! (delegations, liquidity decisions, trust & safety signals, reliability
//! plans, ...) appends to one of these rather than rolling its own `Vec`.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// One recorded entry. `recorded_at_ms` is the ledger's own monotone
/// ordering key (wall-clock-derived, not user-supplied), `id` breaks ties for
/// entries recorded in the same millisecond (spec.md §4.7's stable sort is
/// `(recorded_at_ms, id)`).
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub tenant_id: String,
    pub kind: String,
    pub recorded_at_iso: String,
    pub recorded_at_ms: i64,
    pub payload: Value,
}

/// Append-only store, scoped by `(tenant_id, kind)`. Entries within a scope
/// are kept in append order, which is already `(recorded_at_ms, id)`-sorted
/// as long as the single-writer invariant holds (spec.md §5).
#[derive(Default)]
pub struct Ledger {
    scopes: HashMap<(String, String), Vec<LedgerEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            scopes: HashMap::new(),
        }
    }

    pub fn append(
        &mut self,
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        kind: impl Into<String>,
        recorded_at_iso: impl Into<String>,
        recorded_at_ms: i64,
        payload: Value,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: id.into(),
            tenant_id: tenant_id.into(),
            kind: kind.into(),
            recorded_at_iso: recorded_at_iso.into(),
            recorded_at_ms,
            payload,
        };
        self.scopes
            .entry((entry.tenant_id.clone(), entry.kind.clone()))
            .or_default()
            .push(entry.clone());
        entry
    }

    pub fn scope(&self, tenant_id: &str, kind: &str) -> &[LedgerEntry] {
        self.scopes
            .get(&(tenant_id.to_string(), kind.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, tenant_id: &str, kind: &str, id: &str) -> Option<&LedgerEntry> {
        self.scope(tenant_id, kind).iter().find(|e| e.id == id)
    }

    /// Stable sort of a scope's entries by `(recorded_at_ms, id)`, matching
    /// spec.md §4.7's export-ordering step. Append order already satisfies
    /// this under the single-writer invariant, but callers that filter
    /// before sorting (e.g. export) should still call this explicitly rather
    /// than rely on insertion order.
    pub fn sorted_scope(&self, tenant_id: &str, kind: &str) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self.scope(tenant_id, kind).to_vec();
        entries.sort_by(|a, b| {
            a.recorded_at_ms
                .cmp(&b.recorded_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_are_scoped_by_tenant_and_kind() {
        let mut ledger = Ledger::new();
        ledger.append("e1", "t1", "decision", "2025-01-01T00:00:00.000Z", 1, json!({}));
        ledger.append("e2", "t2", "decision", "2025-01-01T00:00:00.000Z", 1, json!({}));
        assert_eq!(ledger.scope("t1", "decision").len(), 1);
        assert_eq!(ledger.scope("t2", "decision").len(), 1);
        assert_eq!(ledger.scope("t1", "other").len(), 0);
    }

    #[test]
    fn sorted_scope_breaks_ties_by_id() {
        let mut ledger = Ledger::new();
        ledger.append("e2", "t1", "k", "2025-01-01T00:00:00.000Z", 100, json!({}));
        ledger.append("e1", "t1", "k", "2025-01-01T00:00:00.000Z", 100, json!({}));
        let sorted = ledger.sorted_scope("t1", "k");
        assert_eq!(sorted[0].id, "e1");
        assert_eq!(sorted[1].id, "e2");
    }

    #[test]
    fn get_finds_entry_by_id_within_scope() {
        let mut ledger = Ledger::new();
        ledger.append("e1", "t1", "k", "2025-01-01T00:00:00.000Z", 1, json!({"x": 1}));
        let found = ledger.get("t1", "k", "e1").unwrap();
        assert_eq!(found.payload, json!({"x": 1}));
        assert!(ledger.get("t1", "k", "missing").is_none());
    }
}
