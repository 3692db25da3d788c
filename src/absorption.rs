//! Stage machine for joining agents (C5).
//!
//! Mirrors the domain's lifecycle-state pattern: a closed enum of stages
//! with `valid_transitions`/`can_transition_to`, and a candidate struct
//! whose `transition_to` enforces monotonic forward movement. Unlike a
//! generic lifecycle, the absorption stage machine never rolls back — the
//! source is explicit that "the protocol never downgrades a stage."

use crate::domain_types::{AgentId, EmbeddingVector};
use crate::error::AbsorptionError;
use std::collections::HashMap;

/// The absorption pipeline's closed set of stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AbsorptionStage {
    Observed,
    Assessed,
    Invited,
    Connected,
    Syncing,
    Absorbed,
}

impl AbsorptionStage {
    /// The single valid next stage, or `None` for the terminal stage.
    /// Transitions are a strict linear chain — there is never a branch.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Observed => Some(Self::Assessed),
            Self::Assessed => Some(Self::Invited),
            Self::Invited => Some(Self::Connected),
            Self::Connected => Some(Self::Syncing),
            Self::Syncing => Some(Self::Absorbed),
            Self::Absorbed => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.next() == Some(next)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Absorbed)
    }

    /// The capability set granted at this stage. `observed`, `assessed`,
    /// `invited` grant none (server-driven advancement only); `connected`
    /// and `syncing` grant messaging capabilities; `absorbed` additionally
    /// grants `spawn` and `admin`.
    #[must_use]
    pub fn capabilities(self) -> &'static [&'static str] {
        match self {
            Self::Observed | Self::Assessed | Self::Invited => &[],
            Self::Connected | Self::Syncing => &["message", "broadcast", "coherence"],
            Self::Absorbed => &["message", "broadcast", "coherence", "spawn", "admin"],
        }
    }
}

impl std::fmt::Display for AbsorptionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Observed => "observed",
            Self::Assessed => "assessed",
            Self::Invited => "invited",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
            Self::Absorbed => "absorbed",
        };
        write!(f, "{s}")
    }
}

const INTERACTIONS_THRESHOLD: u32 = 3;
const ALIGNMENT_THRESHOLD: f64 = 0.7;

/// Static label for a stage, for the `rail_absorption_stage_total` metric
/// (which needs `&'static str`, unlike `AbsorptionStage`'s `Display` impl).
fn stage_label(stage: AbsorptionStage) -> &'static str {
    match stage {
        AbsorptionStage::Observed => "observed",
        AbsorptionStage::Assessed => "assessed",
        AbsorptionStage::Invited => "invited",
        AbsorptionStage::Connected => "connected",
        AbsorptionStage::Syncing => "syncing",
        AbsorptionStage::Absorbed => "absorbed",
    }
}

/// One agent's progress through the absorption pipeline.
#[derive(Debug, Clone)]
pub struct AbsorptionCandidate {
    pub agent_id: AgentId,
    pub stage: AbsorptionStage,
    pub interactions: u32,
    pub alignment: f64,
    pub identity_embedding: Option<EmbeddingVector>,
}

impl AbsorptionCandidate {
    fn observed(agent_id: AgentId, embedding: Option<EmbeddingVector>) -> Self {
        Self {
            agent_id,
            stage: AbsorptionStage::Observed,
            interactions: 1,
            alignment: 0.0,
            identity_embedding: embedding,
        }
    }

    fn transition_to(&mut self, next: AbsorptionStage) -> Result<(), AbsorptionError> {
        if !self.stage.can_transition_to(next) {
            return Err(AbsorptionError::InvalidTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        crate::observability::record_absorption_stage(stage_label(next));
        Ok(())
    }
}

/// The in-memory table of absorption candidates, keyed by agent id.
///
/// Invariant enforced at this layer: an agent is either in this table or
/// in the Client registry, but never both — the caller (Rail Core) must
/// call `remove` when a candidate reaches `connected` and joins the
/// registry proper.
#[derive(Default)]
pub struct AbsorptionTable {
    candidates: HashMap<AgentId, AbsorptionCandidate>,
    absorbed_embeddings: Vec<EmbeddingVector>,
}

impl AbsorptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<&AbsorptionCandidate> {
        self.candidates.get(agent_id)
    }

    /// Counts candidates currently at each stage, keyed by the stage's
    /// display name — used by the metadata broadcaster's
    /// `absorptionStats`.
    #[must_use]
    pub fn stage_counts(&self) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for candidate in self.candidates.values() {
            *counts.entry(candidate.stage.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn remove(&mut self, agent_id: &AgentId) {
        self.candidates.remove(agent_id);
    }

    /// Records one observation of `agent_id`. First contact inserts the
    /// candidate as `observed` with `interactions = 1`. Subsequent calls
    /// increment `interactions`, recompute `alignment` against the mean of
    /// absorbed members' embeddings, and advance to `assessed` once both
    /// the interaction and alignment thresholds are met.
    pub fn observe(&mut self, agent_id: AgentId, embedding: Option<EmbeddingVector>) {
        if let Some(existing) = self.candidates.get(&agent_id) {
            if existing.stage != AbsorptionStage::Observed {
                // Already advanced past the stage `observe` can affect;
                // treat as a no-op interaction bump only.
                if let Some(c) = self.candidates.get_mut(&agent_id) {
                    c.interactions += 1;
                }
                return;
            }
        } else {
            self.candidates.insert(agent_id.clone(), AbsorptionCandidate::observed(agent_id.clone(), embedding));
            return;
        }

        let mean = EmbeddingVector::mean(self.absorbed_embeddings.iter());
        let candidate = self.candidates.get_mut(&agent_id).unwrap();
        candidate.interactions += 1;
        if let (Some(emb), Some(mean)) = (&embedding, &mean) {
            candidate.alignment = emb.cosine_similarity(mean);
        }
        if embedding.is_some() {
            candidate.identity_embedding = embedding;
        }

        if candidate.interactions >= INTERACTIONS_THRESHOLD && candidate.alignment >= ALIGNMENT_THRESHOLD {
            let _ = candidate.transition_to(AbsorptionStage::Assessed);
        }
    }

    /// Advances `assessed` to `invited`, only if the interaction and
    /// alignment thresholds are (still) met.
    pub fn invite_candidate(&mut self, agent_id: &AgentId) -> Result<(), AbsorptionError> {
        let candidate = self.candidates.get_mut(agent_id).ok_or(AbsorptionError::ThresholdNotMet)?;
        if candidate.interactions < INTERACTIONS_THRESHOLD || candidate.alignment < ALIGNMENT_THRESHOLD {
            return Err(AbsorptionError::ThresholdNotMet);
        }
        candidate.transition_to(AbsorptionStage::Invited)
    }

    /// Advances `invited` to `connected`. The caller is responsible for
    /// the capability issuance side effect and for registering the agent
    /// in the Client registry (removing it from this table is left to the
    /// caller too, since `connected` candidates still progress through
    /// `syncing`/`absorbed` here).
    pub fn accept_invitation(&mut self, agent_id: &AgentId) -> Result<(), AbsorptionError> {
        let candidate = self.candidates.get_mut(agent_id).ok_or(AbsorptionError::AlreadyConnected)?;
        candidate.transition_to(AbsorptionStage::Connected)
    }

    /// Advances `connected` to `syncing`.
    pub fn begin_syncing(&mut self, agent_id: &AgentId) -> Result<(), AbsorptionError> {
        let candidate = self.candidates.get_mut(agent_id).ok_or(AbsorptionError::ThresholdNotMet)?;
        candidate.transition_to(AbsorptionStage::Syncing)
    }

    /// Advances `syncing` to `absorbed`, contributing the candidate's
    /// embedding (if any) to the running alignment mean for future
    /// candidates.
    pub fn absorb(&mut self, agent_id: &AgentId) -> Result<(), AbsorptionError> {
        let candidate = self.candidates.get_mut(agent_id).ok_or(AbsorptionError::ThresholdNotMet)?;
        candidate.transition_to(AbsorptionStage::Absorbed)?;
        if let Some(embedding) = candidate.identity_embedding.clone() {
            self.absorbed_embeddings.push(embedding);
        }
        Ok(())
    }
}

#[cfg(test)]
impl AbsorptionTable {
    /// Test-only seam: drops a candidate straight into `stage` without
    /// running the threshold checks, so callers outside this module can
    /// exercise stage-dependent behavior (e.g. `RailCore`'s tick-driven
    /// advancement) without re-deriving interaction/alignment history.
    pub(crate) fn seed_stage_for_test(&mut self, agent_id: AgentId, stage: AbsorptionStage) {
        self.candidates.insert(
            agent_id.clone(),
            AbsorptionCandidate { agent_id, stage, interactions: 10, alignment: 1.0, identity_embedding: None },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(n: &str) -> AgentId {
        AgentId::try_new(n.to_string()).unwrap()
    }

    #[test]
    fn first_contact_inserts_as_observed() {
        let mut table = AbsorptionTable::new();
        table.observe(agent("a"), None);
        let c = table.get(&agent("a")).unwrap();
        assert_eq!(c.stage, AbsorptionStage::Observed);
        assert_eq!(c.interactions, 1);
    }

    #[test]
    fn stage_counts_tallies_by_current_stage() {
        let mut table = AbsorptionTable::new();
        table.observe(agent("a"), None);
        table.observe(agent("b"), None);
        let counts = table.stage_counts();
        assert_eq!(counts.get("observed"), Some(&2));
    }

    #[test]
    fn advances_to_assessed_after_threshold_and_alignment() {
        let mut table = AbsorptionTable::new();
        let emb = EmbeddingVector::new(vec![1.0, 0.0]);
        // Seed an absorbed member whose embedding matches perfectly.
        table.candidates.insert(
            agent("seed"),
            AbsorptionCandidate {
                agent_id: agent("seed"),
                stage: AbsorptionStage::Absorbed,
                interactions: 10,
                alignment: 1.0,
                identity_embedding: Some(emb.clone()),
            },
        );
        table.absorbed_embeddings.push(emb.clone());

        table.observe(agent("a"), Some(emb.clone()));
        table.observe(agent("a"), Some(emb.clone()));
        table.observe(agent("a"), Some(emb.clone()));

        let c = table.get(&agent("a")).unwrap();
        assert_eq!(c.stage, AbsorptionStage::Assessed);
    }

    #[test]
    fn stage_never_downgrades() {
        let stage = AbsorptionStage::Connected;
        assert!(!stage.can_transition_to(AbsorptionStage::Observed));
        assert!(!stage.can_transition_to(AbsorptionStage::Assessed));
    }

    #[test]
    fn capabilities_escalate_by_stage() {
        assert!(AbsorptionStage::Observed.capabilities().is_empty());
        assert_eq!(AbsorptionStage::Connected.capabilities(), &["message", "broadcast", "coherence"]);
        assert!(AbsorptionStage::Absorbed.capabilities().contains(&"admin"));
    }

    #[test]
    fn invite_fails_below_threshold() {
        let mut table = AbsorptionTable::new();
        table.observe(agent("a"), None);
        let result = table.invite_candidate(&agent("a"));
        assert!(result.is_err());
    }

    #[test]
    fn full_pipeline_reaches_absorbed() {
        let mut table = AbsorptionTable::new();
        let a = agent("a");
        table.candidates.insert(
            a.clone(),
            AbsorptionCandidate {
                agent_id: a.clone(),
                stage: AbsorptionStage::Assessed,
                interactions: 5,
                alignment: 0.9,
                identity_embedding: None,
            },
        );
        table.invite_candidate(&a).unwrap();
        table.accept_invitation(&a).unwrap();
        table.begin_syncing(&a).unwrap();
        table.absorb(&a).unwrap();
        assert_eq!(table.get(&a).unwrap().stage, AbsorptionStage::Absorbed);
    }
}
