//! C9: Metadata broadcaster.
//!
//! An independent ticker that periodically aggregates system state into a
//! `metadata` frame. Reads snapshots only (client phases, order
//! parameter, absorption/auth stats) and never blocks the tick loop — it
//! holds no locks the tick loop also needs for longer than a snapshot
//! read.

use crate::domain_types::OrderParameter;
use serde_json::{Value, json};
use std::collections::HashMap;

/// One client's contribution to the energy landscape snapshot.
#[derive(Debug, Clone, Copy)]
pub struct EnergyEntry {
    pub energy: f64,
    pub probability: f64,
}

/// The inputs the broadcaster needs for one cycle, gathered by the
/// caller (`server.rs`) from `RailCore` and `KuramotoEngine` snapshots —
/// this module itself is pure with respect to them.
#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub platform_counts: HashMap<String, u32>,
    pub absorption_stage_counts: HashMap<String, u32>,
    pub coherence_contributions: HashMap<String, f64>,
    pub trust_scores: HashMap<String, f64>,
    pub order_parameter: OrderParameter,
    pub mean_phase: f64,
    pub oscillator_phases: HashMap<String, f64>,
    pub per_model_order_parameters: HashMap<String, OrderParameter>,
    pub has_model_types: bool,
    pub external_agent_count: u32,
    pub firewall_blocks_total: u64,
}

/// Builds the `metadata` broadcast payload for one cycle. `is_full`
/// selects between a full snapshot (every `full_snapshot_every` cycles)
/// and a diff against `previous` restricted to changed top-level fields.
#[must_use]
pub fn build_snapshot(input: &SnapshotInput, previous: Option<&Value>, is_full: bool) -> Value {
    let n = input.coherence_contributions.len().max(1);
    #[allow(clippy::cast_precision_loss)]
    let uniform_probability = 1.0 / n as f64;

    let energy_landscape: HashMap<String, EnergyEntry> = input
        .coherence_contributions
        .iter()
        .map(|(agent_id, coherence)| {
            (agent_id.clone(), EnergyEntry { energy: 1.0 - coherence, probability: uniform_probability })
        })
        .collect();

    let mut full = json!({
        "event": "metadata",
        "full": is_full,
        "platformStats": input.platform_counts,
        "absorptionStats": input.absorption_stage_counts,
        "energyLandscape": energy_landscape.iter().map(|(id, e)| {
            (id.clone(), json!({ "energy": e.energy, "probability": e.probability }))
        }).collect::<HashMap<_, _>>(),
        "trustScores": input.trust_scores,
        "coherenceField": {
            "oscillators": input.oscillator_phases,
            "globalR": input.order_parameter.into_inner(),
            "meanPhase": input.mean_phase,
        },
        "externalAgentCount": input.external_agent_count,
        "securityStats": {
            "firewallBlocksTotal": input.firewall_blocks_total,
        },
    });

    if input.has_model_types {
        full["coherenceField"]["perModel"] = json!(
            input.per_model_order_parameters.iter().map(|(m, r)| (m.clone(), r.into_inner())).collect::<HashMap<_, _>>()
        );
    }

    if is_full {
        return full;
    }

    let Some(previous) = previous else {
        return full;
    };

    let mut diff = json!({ "event": "metadata", "full": false });
    if let (Value::Object(full_map), Value::Object(prev_map), Value::Object(diff_map)) =
        (&full, previous, diff.as_object_mut().unwrap())
    {
        for (key, value) in full_map {
            if key == "event" || key == "full" {
                continue;
            }
            if prev_map.get(key) != Some(value) {
                diff_map.insert(key.clone(), value.clone());
            }
        }
    }
    diff
}

/// Decides whether cycle number `cycle` (1-indexed) should be a full
/// snapshot, given `full_snapshot_every`.
#[must_use]
pub fn is_full_cycle(cycle: u64, full_snapshot_every: u32) -> bool {
    full_snapshot_every == 0 || cycle % u64::from(full_snapshot_every) == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> SnapshotInput {
        let mut coherence_contributions = HashMap::new();
        coherence_contributions.insert("agent-A".to_string(), 0.8);
        SnapshotInput {
            platform_counts: HashMap::new(),
            absorption_stage_counts: HashMap::new(),
            coherence_contributions,
            trust_scores: HashMap::new(),
            order_parameter: OrderParameter::try_new(0.5).unwrap(),
            mean_phase: 1.0,
            oscillator_phases: HashMap::new(),
            per_model_order_parameters: HashMap::new(),
            has_model_types: false,
            external_agent_count: 0,
            firewall_blocks_total: 0,
        }
    }

    #[test]
    fn first_cycle_is_always_full() {
        assert!(is_full_cycle(1, 10));
        assert!(!is_full_cycle(2, 10));
        assert!(is_full_cycle(11, 10));
    }

    #[test]
    fn full_snapshot_has_full_true() {
        let input = sample_input();
        let snapshot = build_snapshot(&input, None, true);
        assert_eq!(snapshot["full"], json!(true));
        assert_eq!(snapshot["coherenceField"]["globalR"], json!(0.5));
    }

    #[test]
    fn diff_only_includes_changed_fields() {
        let input = sample_input();
        let previous = build_snapshot(&input, None, true);

        let mut changed_input = input.clone();
        changed_input.external_agent_count = 7;
        let diff = build_snapshot(&changed_input, Some(&previous), false);

        assert_eq!(diff["full"], json!(false));
        assert_eq!(diff["externalAgentCount"], json!(7));
        assert!(diff.get("platformStats").is_none(), "unchanged field should be omitted from the diff");
    }

    #[test]
    fn per_model_breakdown_included_only_when_model_types_present() {
        let mut input = sample_input();
        let snapshot = build_snapshot(&input, None, true);
        assert!(snapshot["coherenceField"].get("perModel").is_none());

        input.has_model_types = true;
        input.per_model_order_parameters.insert("gpt".to_string(), OrderParameter::try_new(0.9).unwrap());
        let snapshot = build_snapshot(&input, None, true);
        assert_eq!(snapshot["coherenceField"]["perModel"]["gpt"], json!(0.9));
    }
}
