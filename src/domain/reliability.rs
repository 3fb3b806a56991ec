//! Reliability remediation planning (spec.md §3, §4.11).
//!
//! `suggest` aggregates SLO metrics, incident drills, and replay checks over
//! a window and deterministically emits a ranked set of actions keyed by
//! signal summary, then persists the plan. Re-running `suggest` with
//! identical inputs produces an identical action list — no randomness, no
//! wall-clock-dependent tie-breaking.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloMetric {
    pub name: String,
    pub target: f64,
    pub observed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentDrill {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayCheck {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub action_code: String,
    pub priority: u32,
    pub signal_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub plan_id: String,
    pub tenant_id: String,
    pub window_label: String,
    pub actions: Vec<RemediationAction>,
    pub generated_at: String,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn slo_priority(deficit: f64) -> u32 {
    if deficit >= 10.0 {
        100
    } else if deficit >= 1.0 {
        70
    } else {
        40
    }
}

#[derive(Default)]
pub struct ReliabilityStore {
    pub plans: HashMap<String, Vec<RemediationPlan>>,
}

impl ReliabilityStore {
    #[allow(clippy::too_many_arguments)]
    pub fn suggest(
        &mut self,
        plan_id: &str,
        tenant_id: &str,
        window_label: &str,
        slo_metrics: &[SloMetric],
        drills: &[IncidentDrill],
        replay_checks: &[ReplayCheck],
        now_iso: &str,
    ) -> CoreResult<RemediationPlan> {
        let mut actions = Vec::new();

        for metric in slo_metrics {
            if metric.observed > metric.target {
                let deficit = round2(metric.observed - metric.target);
                actions.push(RemediationAction {
                    action_code: format!("tighten_slo_{}", metric.name),
                    priority: slo_priority(deficit),
                    signal_summary: format!(
                        "slo:{} observed={} target={}",
                        metric.name, metric.observed, metric.target
                    ),
                });
            }
        }
        for drill in drills {
            if !drill.passed {
                actions.push(RemediationAction {
                    action_code: format!("rerun_incident_drill_{}", drill.name),
                    priority: 80,
                    signal_summary: format!("drill:{} failed", drill.name),
                });
            }
        }
        for check in replay_checks {
            if !check.passed {
                actions.push(RemediationAction {
                    action_code: format!("rerun_replay_check_{}", check.name),
                    priority: 90,
                    signal_summary: format!("replay:{} failed", check.name),
                });
            }
        }

        actions.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.signal_summary.cmp(&b.signal_summary))
        });
        actions.dedup_by(|a, b| a.signal_summary == b.signal_summary);

        let plan = RemediationPlan {
            plan_id: plan_id.to_string(),
            tenant_id: tenant_id.to_string(),
            window_label: window_label.to_string(),
            actions,
            generated_at: now_iso.to_string(),
        };
        self.plans
            .entry(tenant_id.to_string())
            .or_default()
            .push(plan.clone());
        Ok(plan)
    }

    pub fn get(&self, tenant_id: &str, plan_id: &str) -> CoreResult<RemediationPlan> {
        self.plans
            .get(tenant_id)
            .and_then(|plans| plans.iter().find(|p| p.plan_id == plan_id))
            .cloned()
            .ok_or_else(|| CoreError::not_found("reliability_remediation_plan_not_found"))
    }

    pub fn list(&self, tenant_id: &str) -> Vec<RemediationPlan> {
        self.plans.get(tenant_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Vec<SloMetric> {
        vec![
            SloMetric { name: "availability".into(), target: 99.9, observed: 99.9 },
            SloMetric { name: "latency_p99_ms".into(), target: 200.0, observed: 215.0 },
        ]
    }

    #[test]
    fn suggest_is_deterministic_across_identical_inputs() {
        let mut store = ReliabilityStore::default();
        let p1 = store
            .suggest("plan_1", "t1", "7d", &metrics(), &[], &[], "2025-01-01T00:00:00.000Z")
            .unwrap();
        let p2 = store
            .suggest("plan_2", "t1", "7d", &metrics(), &[], &[], "2025-01-01T01:00:00.000Z")
            .unwrap();
        assert_eq!(p1.actions, p2.actions);
    }

    #[test]
    fn only_breached_metrics_produce_actions() {
        let mut store = ReliabilityStore::default();
        let plan = store
            .suggest("plan_1", "t1", "7d", &metrics(), &[], &[], "2025-01-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].action_code, "tighten_slo_latency_p99_ms");
    }

    #[test]
    fn failed_drills_and_replay_checks_outrank_slo_breaches() {
        let mut store = ReliabilityStore::default();
        let plan = store
            .suggest(
                "plan_1",
                "t1",
                "7d",
                &metrics(),
                &[IncidentDrill { name: "failover".into(), passed: false }],
                &[ReplayCheck { name: "ledger_replay".into(), passed: false }],
                "2025-01-01T00:00:00.000Z",
            )
            .unwrap();
        assert_eq!(plan.actions[0].action_code, "rerun_replay_check_ledger_replay");
        assert_eq!(plan.actions[1].action_code, "rerun_incident_drill_failover");
    }

    #[test]
    fn get_and_list_round_trip() {
        let mut store = ReliabilityStore::default();
        store
            .suggest("plan_1", "t1", "7d", &metrics(), &[], &[], "2025-01-01T00:00:00.000Z")
            .unwrap();
        assert!(store.get("t1", "plan_1").is_ok());
        assert_eq!(store.list("t1").len(), 1);
        let err = store.get("t1", "plan_missing").unwrap_err();
        assert_eq!(err.reason_code(), Some("reliability_remediation_plan_not_found"));
    }
}
