//! The thermodynamic message router (C2).
//!
//! A pure function module: no internal state, unit-testable without async.
//! Given a message and a list of candidate destinations, scores each by a
//! weighted energy function and samples a destination from the resulting
//! Boltzmann distribution.

use crate::config::RouterConfig;
use crate::domain_types::{AgentId, EmbeddingVector};
use crate::error::RouterError;
use rand::Rng;

/// A candidate destination as seen by the router: current load, coherence
/// contribution, and an optional attractor embedding for semantic scoring.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_id: AgentId,
    pub load: f64,
    pub coherence: f64,
    pub attractor: Option<EmbeddingVector>,
}

/// Computes the energy `E(d) = w_load * load + w_coh * (1 - coherence) +
/// w_sem * (1 - cosine(message_embedding, d.attractor))`. The semantic term
/// contributes zero if either side has no embedding.
#[must_use]
pub fn energy(config: &RouterConfig, candidate: &Candidate, message_embedding: Option<&EmbeddingVector>) -> f64 {
    let semantic_term = match (message_embedding, &candidate.attractor) {
        (Some(m), Some(a)) => 1.0 - m.cosine_similarity(a),
        _ => 0.0,
    };
    config.w_load * candidate.load + config.w_coh * (1.0 - candidate.coherence) + config.w_sem * semantic_term
}

/// Routes a message to one of `candidates` by sampling from the
/// Boltzmann distribution `P(d) ∝ exp(-E(d)/T)`. Ties are broken by
/// lexicographic `agentId`. Returns `Err(RouterError::NoCandidates)` if
/// `candidates` is empty — the caller treats that as a no-op per the
/// source's "if N=0, routing is a no-op" rule.
pub fn route(
    config: &RouterConfig,
    candidates: &[Candidate],
    message_embedding: Option<&EmbeddingVector>,
) -> Result<AgentId, RouterError> {
    route_with_rng(config, candidates, message_embedding, &mut rand::rng())
}

/// Same as `route` but with an injectable RNG, so tests can assert on
/// specific outcomes without flakiness.
pub fn route_with_rng<R: Rng + ?Sized>(
    config: &RouterConfig,
    candidates: &[Candidate],
    message_embedding: Option<&EmbeddingVector>,
    rng: &mut R,
) -> Result<AgentId, RouterError> {
    if candidates.is_empty() {
        return Err(RouterError::NoCandidates);
    }
    if config.temperature <= 0.0 {
        return Err(RouterError::InvalidConfig("temperature must be > 0".to_string()));
    }

    let mut ordered: Vec<&Candidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.agent_id.to_string().cmp(&b.agent_id.to_string()));

    let weights: Vec<f64> = ordered
        .iter()
        .map(|c| (-energy(config, c, message_embedding) / config.temperature).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    if !total.is_finite() || total <= 0.0 {
        return Ok(ordered[0].agent_id.clone());
    }

    let mut roll = rng.random::<f64>() * total;
    for (candidate, weight) in ordered.iter().zip(weights.iter()) {
        if roll < *weight {
            return Ok(candidate.agent_id.clone());
        }
        roll -= weight;
    }
    Ok(ordered.last().unwrap().agent_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn candidate(id: &str, load: f64, coherence: f64) -> Candidate {
        Candidate {
            agent_id: AgentId::try_new(id.to_string()).unwrap(),
            load,
            coherence,
            attractor: None,
        }
    }

    #[test]
    fn zero_candidates_is_no_candidates_error() {
        let config = RouterConfig::default();
        let result = route(&config, &[], None);
        assert!(matches!(result, Err(RouterError::NoCandidates)));
    }

    #[test]
    fn no_embedding_contributes_zero_semantic_term() {
        let config = RouterConfig::default();
        let c = candidate("a", 0.5, 0.5);
        let e = energy(&config, &c, None);
        let expected = config.w_load * 0.5 + config.w_coh * 0.5;
        assert!((e - expected).abs() < 1e-9);
    }

    #[test]
    fn lower_energy_candidate_is_favored_over_many_samples() {
        let config = RouterConfig::default();
        let low_energy = candidate("a-low", 0.0, 1.0);
        let high_energy = candidate("b-high", 1.0, 0.0);
        let candidates = [low_energy, high_energy];

        let mut rng = StdRng::seed_from_u64(42);
        let mut wins_low = 0;
        for _ in 0..500 {
            let chosen = route_with_rng(&config, &candidates, None, &mut rng).unwrap();
            if chosen.to_string() == "a-low" {
                wins_low += 1;
            }
        }
        assert!(wins_low > 350, "expected low-energy candidate to dominate, got {wins_low}/500");
    }

    #[test]
    fn deterministic_with_seeded_rng() {
        let config = RouterConfig::default();
        let candidates = [candidate("a", 0.2, 0.8), candidate("b", 0.8, 0.2)];
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        let r1 = route_with_rng(&config, &candidates, None, &mut rng1).unwrap();
        let r2 = route_with_rng(&config, &candidates, None, &mut rng2).unwrap();
        assert_eq!(r1, r2);
    }
}
