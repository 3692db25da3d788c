//! C7: Trace synthesizer.
//!
//! Answers a `synthesize` request by ranking persisted traces against a
//! query embedding and a per-agent coherence contribution, then rendering
//! a short human-readable summary alongside the ranked records. Pure with
//! respect to its inputs — the over-fetch, dedupe, score, and sort steps
//! take an already-loaded slice of traces plus a coherence lookup, so the
//! ranking logic itself can be exercised without a database.

use crate::domain_types::{CoherenceContribution, EmbeddingVector};
use crate::storage::repository::TraceRecord;
use std::collections::HashSet;

/// Weight given to semantic similarity in the synthesis score.
const SIMILARITY_WEIGHT: f64 = 0.7;
/// Weight given to the authoring agent's coherence contribution.
const COHERENCE_WEIGHT: f64 = 0.3;
/// Over-fetch factor: load `2 * limit` candidate rows before ranking, so
/// that deduplication and scoring have enough headroom to still return
/// `limit` distinct traces.
const OVER_FETCH_FACTOR: i64 = 2;

/// One ranked trace in a synthesis result.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTrace {
    pub id: String,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub content: String,
    pub similarity: f64,
    pub score: f64,
}

/// The full result of a synthesis request: the ranked traces plus a
/// rendered text summary suitable for direct inclusion in a `synthesize`
/// response payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub traces: Vec<RankedTrace>,
    pub summary: String,
}

/// Returns the fetch size the caller should request from storage before
/// calling [`rank`], i.e. `2 * limit` (at least `limit` itself, so a
/// `limit` of zero still fetches nothing).
#[must_use]
pub fn fetch_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX).saturating_mul(OVER_FETCH_FACTOR)
}

/// Ranks `candidates` against `query_embedding`, using `coherence_of` to
/// look up each trace's authoring agent's current coherence contribution
/// (defaulting to `0.0` for agents with no known contribution), and
/// returns the top `limit` distinct traces by score along with a rendered
/// summary.
///
/// Candidates are deduplicated by trace id before scoring (the over-fetch
/// at the call site can otherwise surface the same row twice if storage
/// pagination overlaps).
pub fn rank(
    candidates: &[TraceRecord],
    query_embedding: Option<&EmbeddingVector>,
    limit: usize,
    coherence_of: impl Fn(&str) -> CoherenceContribution,
) -> SynthesisResult {
    let mut seen = HashSet::new();
    let mut scored: Vec<RankedTrace> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        if !seen.insert(candidate.id.clone()) {
            continue;
        }
        let similarity = match (query_embedding, &candidate.embedding) {
            (Some(query), Some(trace_embedding)) => query.cosine_similarity(trace_embedding),
            _ => 0.0,
        };
        let coherence: f64 = coherence_of(&candidate.agent_id).into();
        let score = SIMILARITY_WEIGHT * similarity + COHERENCE_WEIGHT * coherence;
        scored.push(RankedTrace {
            id: candidate.id.clone(),
            agent_id: candidate.agent_id.clone(),
            agent_name: candidate.agent_name.clone(),
            content: candidate.content.clone(),
            similarity,
            score,
        });
    }

    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    scored.truncate(limit);

    let summary = render_summary(&scored);
    SynthesisResult { traces: scored, summary }
}

fn render_summary(traces: &[RankedTrace]) -> String {
    traces
        .iter()
        .map(|t| {
            let label = t.agent_name.as_deref().unwrap_or(t.agent_id.as_str());
            format!("[{label}] (similarity: {:.3}): {}", t.similarity, t.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn trace(id: &str, agent_id: &str, content: &str, embedding: Option<Vec<f32>>) -> TraceRecord {
        TraceRecord {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            agent_name: None,
            content: content.to_string(),
            embedding: embedding.map(EmbeddingVector::new),
            kind: "note".to_string(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ranks_higher_similarity_first() {
        let query = EmbeddingVector::new(vec![1.0, 0.0]);
        let candidates = vec![
            trace("a", "agent-1", "orthogonal", Some(vec![0.0, 1.0])),
            trace("b", "agent-2", "aligned", Some(vec![1.0, 0.0])),
        ];
        let result = rank(&candidates, Some(&query), 10, |_| CoherenceContribution::default());
        assert_eq!(result.traces[0].id, "b");
        assert!(result.traces[0].similarity > result.traces[1].similarity);
    }

    #[test]
    fn deduplicates_by_trace_id() {
        let candidates = vec![trace("a", "agent-1", "first", None), trace("a", "agent-1", "first", None)];
        let result = rank(&candidates, None, 10, |_| CoherenceContribution::default());
        assert_eq!(result.traces.len(), 1);
    }

    #[test]
    fn truncates_to_limit() {
        let candidates: Vec<_> = (0..5).map(|i| trace(&i.to_string(), "agent-1", "x", None)).collect();
        let result = rank(&candidates, None, 2, |_| CoherenceContribution::default());
        assert_eq!(result.traces.len(), 2);
    }

    #[test]
    fn summary_lines_include_agent_label_and_similarity() {
        let query = EmbeddingVector::new(vec![1.0, 0.0]);
        let candidates = vec![trace("a", "agent-1", "hello world", Some(vec![1.0, 0.0]))];
        let result = rank(&candidates, Some(&query), 10, |_| CoherenceContribution::default());
        assert!(result.summary.contains("agent-1"));
        assert!(result.summary.contains("hello world"));
        assert!(result.summary.contains("similarity: 1.000"));
    }

    #[test]
    fn coherence_contribution_breaks_similarity_ties() {
        let candidates = vec![trace("a", "agent-1", "x", None), trace("b", "agent-2", "y", None)];
        let result = rank(&candidates, None, 10, |agent_id| {
            if agent_id == "agent-2" { CoherenceContribution::try_new(0.9).unwrap() } else { CoherenceContribution::default() }
        });
        assert_eq!(result.traces[0].id, "b");
    }

    #[test]
    fn fetch_limit_doubles_requested_limit() {
        assert_eq!(fetch_limit(5), 10);
        assert_eq!(fetch_limit(0), 0);
    }
}
