//! Table-level read/write operations against the embedded database.
//!
//! Plain `&str` SQL constants executed through
//! `sqlx::query`/`sqlx::query_as`, not the compile-time-checked
//! `sqlx::query!()` family (which would require a live `DATABASE_URL` or
//! an offline query cache at build time). Row parsing is done by hand via
//! small `row_to_*` helpers.

use crate::domain_types::{EmbeddingVector, MessageSeq};
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool};
use std::collections::HashMap;

/// One row of `rail_traces`.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub id: String,
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub content: String,
    pub embedding: Option<EmbeddingVector>,
    pub kind: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// One row of `rail_message_log`.
#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub seq: MessageSeq,
    pub message_type: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// The current (only authoritative) `rail_pause_state` row.
#[derive(Debug, Clone)]
pub struct PauseSnapshot {
    pub phases: HashMap<String, f64>,
    pub coherence: f64,
}

/// Persists a new enrollment, replacing any existing row for the same
/// `agent_id` (re-enrollment rotates the secret).
pub async fn upsert_enrollment(pool: &SqlitePool, agent_id: &str, secret_hash: &str) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO rail_enrollments (agent_id, secret_hash, enrolled_at) VALUES (?, ?, ?)
         ON CONFLICT(agent_id) DO UPDATE SET secret_hash = excluded.secret_hash, enrolled_at = excluded.enrolled_at",
    )
    .bind(agent_id)
    .bind(secret_hash)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

/// Loads every enrolled `agent_id`, used to restore the auth registry at
/// startup (the secret hash itself is not the HMAC key — the key is
/// provisioned separately and never re-derived from the hash).
pub async fn list_enrollments(pool: &SqlitePool) -> Result<Vec<String>, StorageError> {
    let rows = sqlx::query("SELECT agent_id FROM rail_enrollments").fetch_all(pool).await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("agent_id")).collect())
}

/// Appends a join/leave record to `rail_clients_log`.
pub async fn log_client_action(
    pool: &SqlitePool,
    agent_id: &str,
    agent_name: Option<&str>,
    platform: Option<&str>,
    action: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO rail_clients_log (agent_id, agent_name, platform, action, timestamp) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(agent_id)
    .bind(agent_name)
    .bind(platform)
    .bind(action)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

/// Appends a structured event to `rail_events`.
pub async fn log_event(
    pool: &SqlitePool,
    event_type: &str,
    client_id: Option<&str>,
    details: &Value,
) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO rail_events (type, client_id, details, timestamp) VALUES (?, ?, ?, ?)")
        .bind(event_type)
        .bind(client_id)
        .bind(details.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(pool)
        .await?;
    Ok(())
}

/// Appends one coherence sample to `rail_coherence_log`.
pub async fn log_coherence(
    pool: &SqlitePool,
    coherence: f64,
    agent_count: i64,
    mean_phase: f64,
) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO rail_coherence_log (coherence, agent_count, mean_phase, timestamp) VALUES (?, ?, ?, ?)")
        .bind(coherence)
        .bind(agent_count)
        .bind(mean_phase)
        .bind(Utc::now().timestamp_millis())
        .execute(pool)
        .await?;
    Ok(())
}

/// Overwrites the authoritative pause snapshot. A fresh row is inserted on
/// every call; readers only ever look at the most recent one.
pub async fn save_pause_snapshot(
    pool: &SqlitePool,
    phases: &HashMap<String, f64>,
    coherence: f64,
) -> Result<(), StorageError> {
    let phases_json = serde_json::to_string(phases).unwrap_or_else(|_| "{}".to_string());
    sqlx::query("INSERT INTO rail_pause_state (phases, coherence, created_at) VALUES (?, ?, ?)")
        .bind(phases_json)
        .bind(coherence)
        .bind(Utc::now().timestamp_millis())
        .execute(pool)
        .await?;
    Ok(())
}

/// Loads the most recent pause snapshot, if any.
pub async fn load_latest_pause_snapshot(pool: &SqlitePool) -> Result<Option<PauseSnapshot>, StorageError> {
    let row = sqlx::query("SELECT phases, coherence FROM rail_pause_state ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| {
        let phases_json: String = r.get("phases");
        let phases: HashMap<String, f64> = serde_json::from_str(&phases_json).unwrap_or_default();
        PauseSnapshot { phases, coherence: r.get("coherence") }
    }))
}

/// Appends a trace record. The `id` is caller-generated (a UUID string) so
/// the writer can reference it immediately without a round trip.
pub async fn insert_trace(
    pool: &SqlitePool,
    id: &str,
    agent_id: &str,
    agent_name: Option<&str>,
    content: &str,
    embedding: Option<&EmbeddingVector>,
    kind: &str,
    metadata: &Value,
) -> Result<(), StorageError> {
    let embedding_json = embedding.map(|e| serde_json::to_string(e.as_slice()).unwrap_or_default());
    sqlx::query(
        "INSERT INTO rail_traces (id, agent_id, agent_name, content, embedding, kind, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(agent_id)
    .bind(agent_name)
    .bind(content)
    .bind(embedding_json)
    .bind(kind)
    .bind(metadata.to_string())
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_trace(row: &sqlx::sqlite::SqliteRow) -> TraceRecord {
    let embedding_json: Option<String> = row.get("embedding");
    let embedding = embedding_json.and_then(|s| serde_json::from_str::<Vec<f32>>(&s).ok()).map(EmbeddingVector::new);
    let metadata_json: String = row.get("metadata");
    let created_at_ms: i64 = row.get("created_at");
    TraceRecord {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        agent_name: row.get("agent_name"),
        content: row.get("content"),
        embedding,
        kind: row.get("kind"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_else(Utc::now),
    }
}

/// Searches traces, optionally scoped to a single `agent_id`, loading at
/// most `fetch_limit` most-recent rows matching the scalar filters. The
/// embedding similarity ranking itself happens client-side in
/// `synthesizer.rs` — this function only applies the scalar (non-vector)
/// filters, per the source's "computes cosine similarity client-side"
/// contract.
pub async fn search_traces(
    pool: &SqlitePool,
    agent_id: Option<&str>,
    fetch_limit: i64,
) -> Result<Vec<TraceRecord>, StorageError> {
    let rows = if let Some(agent_id) = agent_id {
        sqlx::query("SELECT * FROM rail_traces WHERE agent_id = ? ORDER BY created_at DESC LIMIT ?")
            .bind(agent_id)
            .bind(fetch_limit)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query("SELECT * FROM rail_traces ORDER BY created_at DESC LIMIT ?")
            .bind(fetch_limit)
            .fetch_all(pool)
            .await?
    };
    Ok(rows.iter().map(row_to_trace).collect())
}

fn row_to_message_log_entry(row: &sqlx::sqlite::SqliteRow) -> MessageLogEntry {
    let payload_json: String = row.get("payload");
    let timestamp_ms: i64 = row.get("timestamp");
    let seq: i64 = row.get("seq");
    MessageLogEntry {
        seq: MessageSeq::from_raw(u64::try_from(seq).unwrap_or(0)),
        message_type: row.get("type"),
        agent_id: row.get("agent_id"),
        agent_name: row.get("agent_name"),
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        timestamp: DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now),
    }
}

/// Appends one entry to the append-only message log and returns the
/// database-assigned `seq`. Callers fall back to a locally incremented
/// counter when this call fails, per the source's "persistence failure
/// never blocks serving" rule — this function's `Result` exists precisely
/// so callers can make that decision.
pub async fn log_message(
    pool: &SqlitePool,
    message_type: &str,
    agent_id: Option<&str>,
    agent_name: Option<&str>,
    payload: &Value,
) -> Result<MessageSeq, StorageError> {
    let result = sqlx::query("INSERT INTO rail_message_log (type, agent_id, agent_name, payload, timestamp) VALUES (?, ?, ?, ?, ?)")
        .bind(message_type)
        .bind(agent_id)
        .bind(agent_name)
        .bind(payload.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(pool)
        .await?;
    Ok(MessageSeq::from_raw(u64::try_from(result.last_insert_rowid()).unwrap_or(0)))
}

/// Loads message-log entries in replay order (ascending `seq`), used by
/// the pause/resume drain and by the `replay` frame handler.
pub async fn load_message_log_since(pool: &SqlitePool, since_seq: u64) -> Result<Vec<MessageLogEntry>, StorageError> {
    let since = i64::try_from(since_seq).unwrap_or(i64::MAX);
    let rows = sqlx::query("SELECT * FROM rail_message_log WHERE seq > ? ORDER BY seq ASC")
        .bind(since)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_message_log_entry).collect())
}

/// Deletes all but the most recent `keep_count` rows of the message log.
pub async fn prune_message_log_keep_count(pool: &SqlitePool, keep_count: u64) -> Result<u64, StorageError> {
    let keep_count = i64::try_from(keep_count).unwrap_or(i64::MAX);
    let result = sqlx::query(
        "DELETE FROM rail_message_log WHERE seq NOT IN (SELECT seq FROM rail_message_log ORDER BY seq DESC LIMIT ?)",
    )
    .bind(keep_count)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Deletes message-log rows older than `keep_since`.
pub async fn prune_message_log_keep_since(pool: &SqlitePool, keep_since: DateTime<Utc>) -> Result<u64, StorageError> {
    let result = sqlx::query("DELETE FROM rail_message_log WHERE timestamp < ?")
        .bind(keep_since.timestamp_millis())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DatabaseConfig, DatabaseConnection};
    use tempfile::tempdir;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::for_testing(dir.path());
        let conn = DatabaseConnection::initialize(config).await.unwrap();
        let pool = conn.pool().clone();
        (dir, pool)
    }

    #[tokio::test]
    async fn enrollment_round_trips() {
        let (_dir, pool) = test_pool().await;
        upsert_enrollment(&pool, "agent-A", "hash1").await.unwrap();
        let agents = list_enrollments(&pool).await.unwrap();
        assert_eq!(agents, vec!["agent-A".to_string()]);
    }

    #[tokio::test]
    async fn message_log_seq_strictly_increases() {
        let (_dir, pool) = test_pool().await;
        let seq1 = log_message(&pool, "heartbeat", Some("agent-A"), None, &Value::Null).await.unwrap();
        let seq2 = log_message(&pool, "heartbeat", Some("agent-A"), None, &Value::Null).await.unwrap();
        assert!(seq2 > seq1);
    }

    #[tokio::test]
    async fn prune_keep_count_retains_only_latest() {
        let (_dir, pool) = test_pool().await;
        for _ in 0..10 {
            log_message(&pool, "heartbeat", None, None, &Value::Null).await.unwrap();
        }
        prune_message_log_keep_count(&pool, 3).await.unwrap();
        let remaining = load_message_log_since(&pool, 0).await.unwrap();
        assert_eq!(remaining.len(), 3);
    }

    #[tokio::test]
    async fn pause_snapshot_overwrite_returns_latest() {
        let (_dir, pool) = test_pool().await;
        let mut phases = HashMap::new();
        phases.insert("agent-A".to_string(), 1.0);
        save_pause_snapshot(&pool, &phases, 0.5).await.unwrap();

        let mut phases2 = HashMap::new();
        phases2.insert("agent-A".to_string(), 2.0);
        save_pause_snapshot(&pool, &phases2, 0.9).await.unwrap();

        let loaded = load_latest_pause_snapshot(&pool).await.unwrap().unwrap();
        assert_eq!(loaded.phases.get("agent-A"), Some(&2.0));
        assert!((loaded.coherence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trace_search_scoped_by_agent() {
        let (_dir, pool) = test_pool().await;
        insert_trace(&pool, "t1", "agent-A", None, "hello", None, "note", &Value::Null).await.unwrap();
        insert_trace(&pool, "t2", "agent-B", None, "world", None, "note", &Value::Null).await.unwrap();

        let results = search_traces(&pool, Some("agent-A"), 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "hello");
    }
}
