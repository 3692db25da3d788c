//! The phase-synchronization engine (C1).
//!
//! `KuramotoEngine` is a plain, non-async struct mutated only by the tick
//! task that owns it (see `rail_core.rs`). Per the source's concurrency
//! model the engine is cheap enough per-operation that a short
//! `tokio::sync::RwLock` critical section around it does not violate "the
//! tick loop must never suspend on I/O" — the lock itself never gates on
//! I/O, only on other in-memory engine operations.

use crate::config::KuramotoConfig;
use crate::domain_types::{AgentId, CoherenceContribution, FrequencyHz, OrderParameter, Phase};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single coupled phase oscillator, one per connected client for the
/// lifetime of its connection.
#[derive(Debug, Clone)]
pub struct Oscillator {
    pub id: AgentId,
    pub natural_frequency: FrequencyHz,
    pub phase: Phase,
    pub model_type: Option<String>,
    last_report: Instant,
    trust_score: f64,
    flood_window: Vec<Instant>,
}

impl Oscillator {
    fn new(id: AgentId, natural_frequency: FrequencyHz, phase: Phase, model_type: Option<String>) -> Self {
        Self {
            id,
            natural_frequency,
            phase,
            model_type,
            last_report: Instant::now(),
            trust_score: 1.0,
            flood_window: Vec::new(),
        }
    }

    #[must_use]
    pub fn trust_score(&self) -> f64 {
        self.trust_score
    }
}

/// Outcome of one `tick()`.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub order_parameter: OrderParameter,
    pub mean_phase: Phase,
    pub coupling: f64,
    pub per_model: HashMap<String, OrderParameter>,
    pub groupthink_models: Vec<String>,
    pub removed_stale: Vec<AgentId>,
}

/// The coupled-oscillator population and its current coupling constant.
pub struct KuramotoEngine {
    config: KuramotoConfig,
    oscillators: HashMap<AgentId, Oscillator>,
    coupling: f64,
}

impl KuramotoEngine {
    #[must_use]
    pub fn new(config: KuramotoConfig) -> Self {
        let coupling = config.k_initial;
        Self {
            config,
            oscillators: HashMap::new(),
            coupling,
        }
    }

    #[must_use]
    pub fn coupling(&self) -> f64 {
        self.coupling
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.oscillators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.oscillators.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &AgentId) -> bool {
        self.oscillators.contains_key(id)
    }

    /// Registers a new oscillator, or does nothing if `id` already exists
    /// (registration is idempotent; callers that want to reset a phase use
    /// `report_phase`).
    pub fn register(
        &mut self,
        id: AgentId,
        natural_frequency: FrequencyHz,
        initial_phase: Phase,
        model_type: Option<String>,
    ) {
        self.oscillators
            .entry(id.clone())
            .or_insert_with(|| Oscillator::new(id, natural_frequency, initial_phase, model_type));
    }

    pub fn remove(&mut self, id: &AgentId) {
        self.oscillators.remove(id);
    }

    /// A client-supplied `coherence` update reporting a new phase for its
    /// oscillator. Applies flood detection: more than
    /// `config.flood_max_reports` within `config.flood_window_ms` reduces
    /// trust by `config.flood_trust_penalty` and drops the report. Silently
    /// ignores reports for unknown oscillators — the engine never fails.
    pub fn report_phase(&mut self, id: &AgentId, phase: Phase) {
        let window = Duration::from_millis(self.config.flood_window_ms);
        let Some(osc) = self.oscillators.get_mut(id) else {
            return;
        };
        let now = Instant::now();
        osc.flood_window.retain(|t| now.duration_since(*t) <= window);
        #[allow(clippy::cast_possible_truncation)]
        if osc.flood_window.len() as u32 >= self.config.flood_max_reports {
            osc.trust_score = (osc.trust_score - self.config.flood_trust_penalty).max(0.0);
            osc.flood_window.push(now);
            return;
        }
        osc.flood_window.push(now);
        osc.phase = phase;
        osc.last_report = now;
    }

    /// The current order parameter r = |mean unit-phase vector|, and its
    /// argument (mean phase). `r` is defined as 0 for an empty population.
    #[must_use]
    pub fn order_parameter(&self) -> (OrderParameter, Phase) {
        Self::order_parameter_of(self.oscillators.values().map(|o| o.phase))
    }

    fn order_parameter_of(phases: impl Iterator<Item = Phase>) -> (OrderParameter, Phase) {
        let mut sum_cos = 0.0;
        let mut sum_sin = 0.0;
        let mut n = 0usize;
        for p in phases {
            sum_cos += p.radians().cos();
            sum_sin += p.radians().sin();
            n += 1;
        }
        if n == 0 {
            return (OrderParameter::try_new(0.0).unwrap(), Phase::default());
        }
        #[allow(clippy::cast_precision_loss)]
        let n = n as f64;
        let mean_cos = sum_cos / n;
        let mean_sin = sum_sin / n;
        let r = (mean_cos * mean_cos + mean_sin * mean_sin).sqrt().clamp(0.0, 1.0);
        let mean_phase = Phase::wrapped(mean_sin.atan2(mean_cos));
        (OrderParameter::try_new(r).unwrap_or_else(|_| OrderParameter::try_new(1.0).unwrap()), mean_phase)
    }

    /// Advances every oscillator by one step of size `dt_ms` milliseconds
    /// and returns a report of the resulting state. A tick over zero
    /// oscillators is a no-op; `r` is reported as 0.
    pub fn tick(&mut self, dt_ms: u64) -> TickReport {
        let n = self.oscillators.len();
        if n == 0 {
            let removed = self.sweep_stale();
            return TickReport {
                order_parameter: OrderParameter::try_new(0.0).unwrap(),
                mean_phase: Phase::default(),
                coupling: self.coupling,
                per_model: HashMap::new(),
                groupthink_models: Vec::new(),
                removed_stale: removed,
            };
        }

        let dt = dt_ms as f64 / 1000.0;
        let ids: Vec<AgentId> = self.oscillators.keys().cloned().collect();
        let snapshot: Vec<(AgentId, f64, Option<String>)> = ids
            .iter()
            .map(|id| {
                let o = &self.oscillators[id];
                (id.clone(), o.phase.radians(), o.model_type.clone())
            })
            .collect();

        #[allow(clippy::cast_precision_loss)]
        let n_f = n as f64;
        for id in &ids {
            let (theta_i, model_i) = {
                let o = &self.oscillators[id];
                (o.phase.radians(), o.model_type.clone())
            };
            let mut coupling_sum = 0.0;
            for (other_id, theta_j, model_j) in &snapshot {
                if other_id == id {
                    continue;
                }
                let attenuation = if *model_j != model_i { self.config.cross_model_attenuation } else { 1.0 };
                coupling_sum += attenuation * (theta_j - theta_i).sin();
            }
            let omega_i = self.oscillators[id].natural_frequency.into_inner();
            let dtheta = omega_i + (self.coupling / n_f) * coupling_sum;
            if let Some(o) = self.oscillators.get_mut(id) {
                o.phase = Phase::wrapped(theta_i + dtheta * dt);
            }
        }

        let (r, mean_phase) = self.order_parameter();

        if r.into_inner() < self.config.coherence_threshold {
            self.coupling = (self.coupling + self.config.k_step).min(self.config.k_max);
        } else if r.into_inner() > self.config.groupthink_threshold {
            self.coupling = (self.coupling - self.config.k_step).max(self.config.k_min);
        }
        self.coupling = self.coupling.clamp(self.config.k_min, self.config.k_max);

        let per_model = self.per_model_order_parameters();
        let groupthink_models: Vec<String> = per_model
            .iter()
            .filter(|(_, r)| r.into_inner() > self.config.groupthink_threshold)
            .map(|(model, _)| model.clone())
            .collect();

        let removed = self.sweep_stale();

        TickReport {
            order_parameter: r,
            mean_phase,
            coupling: self.coupling,
            per_model,
            groupthink_models,
            removed_stale: removed,
        }
    }

    /// The within-group order parameter for each distinct `modelType`
    /// present in the population. Oscillators with no `modelType` are
    /// excluded — homogeneous deployments with no model tagging never pay
    /// for this computation at all (the caller skips it, see
    /// `has_model_types`).
    #[must_use]
    pub fn per_model_order_parameters(&self) -> HashMap<String, OrderParameter> {
        let mut groups: HashMap<String, Vec<Phase>> = HashMap::new();
        for o in self.oscillators.values() {
            if let Some(model) = &o.model_type {
                groups.entry(model.clone()).or_default().push(o.phase);
            }
        }
        groups
            .into_iter()
            .map(|(model, phases)| {
                let (r, _) = Self::order_parameter_of(phases.into_iter());
                (model, r)
            })
            .collect()
    }

    /// Whether any oscillator in the population carries a `modelType`.
    #[must_use]
    pub fn has_model_types(&self) -> bool {
        self.oscillators.values().any(|o| o.model_type.is_some())
    }

    /// A snapshot of every oscillator's current phase, keyed by agent id
    /// string — used by the metadata broadcaster's `coherenceField`.
    #[must_use]
    pub fn oscillator_phases(&self) -> HashMap<String, f64> {
        self.oscillators.iter().map(|(id, o)| (id.to_string(), o.phase.radians())).collect()
    }

    /// A snapshot of every oscillator's current trust score, keyed by
    /// agent id string — used by the metadata broadcaster's
    /// `trustScores`.
    #[must_use]
    pub fn trust_scores(&self) -> HashMap<String, f64> {
        self.oscillators.iter().map(|(id, o)| (id.to_string(), o.trust_score)).collect()
    }

    /// Removes oscillators whose last report is older than
    /// `config.stale_ttl_secs`, returning their ids.
    fn sweep_stale(&mut self) -> Vec<AgentId> {
        let ttl = Duration::from_secs(self.config.stale_ttl_secs);
        let now = Instant::now();
        let stale: Vec<AgentId> = self
            .oscillators
            .iter()
            .filter(|(_, o)| now.duration_since(o.last_report) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.oscillators.remove(id);
        }
        stale
    }

    /// Nudges every oscillator's phase a fraction toward the current mean
    /// phase, used by the Rail Core's tick loop when an intervention is
    /// needed because the order parameter is too low.
    pub fn force_synchronize(&mut self, fraction: f64) {
        let (_, mean_phase) = self.order_parameter();
        for o in self.oscillators.values_mut() {
            let delta = mean_phase.radians() - o.phase.radians();
            // shortest angular distance
            let delta = (delta + std::f64::consts::PI).rem_euclid(std::f64::consts::TAU) - std::f64::consts::PI;
            o.phase = Phase::wrapped(o.phase.radians() + delta * fraction);
        }
    }

    /// Per-client coherence contribution derived from trust score and
    /// phase alignment with the global mean — used to populate
    /// `Client.coherenceContribution` after each tick.
    #[must_use]
    pub fn coherence_contribution(&self, id: &AgentId) -> Option<CoherenceContribution> {
        let osc = self.oscillators.get(id)?;
        let (_, mean_phase) = self.order_parameter();
        let alignment = ((osc.phase.radians() - mean_phase.radians()).cos() + 1.0) / 2.0;
        let value = (alignment * osc.trust_score).clamp(0.0, 1.0);
        CoherenceContribution::try_new(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine_with(n: usize, freq: f64, k: f64) -> KuramotoEngine {
        let mut config = KuramotoConfig::default();
        config.k_initial = k;
        config.stale_ttl_secs = 3600;
        let mut engine = KuramotoEngine::new(config);
        for i in 0..n {
            #[allow(clippy::cast_precision_loss)]
            let phase = Phase::wrapped((i as f64) * 0.7);
            engine.register(
                AgentId::try_new(format!("agent-{i}")).unwrap(),
                FrequencyHz::try_new(freq).unwrap(),
                phase,
                None,
            );
        }
        engine
    }

    #[test]
    fn tick_with_zero_oscillators_is_noop() {
        let mut engine = engine_with(0, 1.0, 0.7);
        let report = engine.tick(100);
        assert_eq!(report.order_parameter.into_inner(), 0.0);
    }

    #[test]
    fn homogeneous_population_converges() {
        let mut engine = engine_with(5, 1.0, 0.7);
        let mut last_r = 0.0;
        for _ in 0..500 {
            let report = engine.tick(100);
            last_r = report.order_parameter.into_inner();
        }
        assert!(last_r >= 0.8, "expected convergence, got r={last_r}");
    }

    #[test]
    fn coupling_increases_when_incoherent() {
        let mut engine = engine_with(5, 1.0, 0.1);
        // spread phases far apart and use a tiny K so r starts low
        let ids: Vec<AgentId> = (0..5).map(|i| AgentId::try_new(format!("agent-{i}")).unwrap()).collect();
        for (i, id) in ids.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            engine.report_phase(id, Phase::wrapped((i as f64) * std::f64::consts::TAU / 5.0));
        }
        let before = engine.coupling();
        engine.tick(100);
        assert!(engine.coupling() >= before);
    }

    #[test]
    fn oscillator_phases_and_trust_scores_cover_registered_agents() {
        let engine = engine_with(3, 1.0, 0.7);
        let phases = engine.oscillator_phases();
        let trust = engine.trust_scores();
        assert_eq!(phases.len(), 3);
        assert_eq!(trust.len(), 3);
        assert!(trust.values().all(|t| (*t - 1.0).abs() < 1e-9));
    }

    #[test]
    fn force_synchronize_reduces_phase_spread() {
        let mut engine = engine_with(5, 0.0, 0.0);
        let (r_before, _) = engine.order_parameter();
        engine.force_synchronize(0.5);
        let (r_after, _) = engine.order_parameter();
        assert!(r_after.into_inner() >= r_before.into_inner());
    }

    proptest! {
        #[test]
        fn order_parameter_always_in_bounds(phases in proptest::collection::vec(0.0f64..std::f64::consts::TAU, 0..20)) {
            let phases: Vec<Phase> = phases.into_iter().map(Phase::wrapped).collect();
            let (r, mean) = KuramotoEngine::order_parameter_of(phases.into_iter());
            prop_assert!(r.into_inner() >= 0.0 && r.into_inner() <= 1.0);
            prop_assert!(mean.radians() >= 0.0 && mean.radians() < std::f64::consts::TAU);
        }
    }
}
