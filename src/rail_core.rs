//! C8: Rail Core — the client registry, message dispatcher, tick loop,
//! pause/resume machinery, and shutdown sequence.
//!
//! This is the composition root of the server's logical state. It never
//! owns sockets (that's `listener.rs`); it is addressed purely by
//! `ClientId`, a value shared with the listener, never a reference — per
//! the source's "cyclic lifetime... the link is by clientId" design note.
//! Outbound frames leave through a broadcast channel the listener
//! subscribes to; a `Unicast` variant carries a routing hint the listener
//! resolves to one socket, while `Broadcast` fans out to all.

use crate::absorption::{AbsorptionStage, AbsorptionTable};
use crate::auth_protocol::AuthRegistry;
use crate::config::AppConfig;
use crate::domain_types::{AgentId, AgentName, EmbeddingVector, MessageSeq, OrderParameter, Phase};
use crate::error::{AuthError, RailError};
use crate::firewall;
use crate::kuramoto::KuramotoEngine;
use crate::message::{AuthToken, Message, MessageType};
use crate::rate_limiter::RateLimiter;
use crate::router::{self, Candidate};
use crate::storage::repository;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::warn;
use uuid::Uuid;

/// Server-assigned identity for a connected socket. Full clients are a
/// bare UUID; observer platforms (§4.3, §4.11.2) carry an `obs-` prefix
/// so their sessions are distinguishable from authenticated agents in
/// logs, `/stats`, and the `sync` reply's `clientId` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientId {
    Full(Uuid),
    Observer(Uuid),
}

impl ClientId {
    #[must_use]
    pub fn new(is_observer: bool) -> Self {
        let id = Uuid::new_v4();
        if is_observer { Self::Observer(id) } else { Self::Full(id) }
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(id) => write!(f, "{id}"),
            Self::Observer(id) => write!(f, "obs-{id}"),
        }
    }
}

/// A connected agent's public-facing state, one per open session.
#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: ClientId,
    pub agent_id: AgentId,
    pub agent_name: Option<AgentName>,
    pub platform: Option<String>,
    pub capabilities: Vec<String>,
    pub phase: f64,
    pub frequency: f64,
    pub coherence_contribution: f64,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

const BASELINE_CAPABILITIES: &[&str] = &["message", "broadcast", "coherence"];
/// Bound on the pause-time FIFO queue; overflow drops the newest frame
/// with a logged warning rather than growing unbounded.
const PAUSE_QUEUE_CAP: usize = 10_000;
/// Fraction of the angular distance to the mean phase nudged per
/// intervention tick when the order parameter falls below threshold.
const INTERVENTION_FRACTION: f64 = 0.1;

/// A join request as assembled by the listener after the first frame is
/// parsed and (for non-observers) the connection/rate caps are checked.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub client_id: ClientId,
    pub agent_id: AgentId,
    pub agent_name: Option<AgentName>,
    pub platform: Option<String>,
    pub auth_token: Option<AuthToken>,
    pub reconnect_token: Option<String>,
    pub is_observer: bool,
}

/// The information the listener needs to build its `sync` reply frame.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub client_id: ClientId,
    pub agent_id: AgentId,
    pub reconnect_token: Option<String>,
    pub coherence: OrderParameter,
    pub agents: Vec<String>,
}

/// An outbound frame emitted onto the shared sink. `Unicast` carries a
/// routing hint; the listener — which owns sockets — resolves it to one
/// connection and is responsible for actual delivery.
#[derive(Debug, Clone)]
pub enum Outbound {
    Broadcast(Message),
    Unicast(ClientId, Message),
}

/// The result of [`RailCore::process_message`] — tells the listener
/// whether the frame was accepted (handled now or queued for replay) or
/// whether the sender tripped a rate-limit window and its socket must be
/// closed with a policy-violation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Accepted,
    RateLimited,
}

fn stage_capabilities(stage: AbsorptionStage) -> Vec<String> {
    stage.capabilities().iter().map(|s| (*s).to_string()).collect()
}

fn stage_capabilities_baseline() -> Vec<String> {
    BASELINE_CAPABILITIES.iter().map(|s| (*s).to_string()).collect()
}

fn event_message(event: &str, mut extra: serde_json::Value) -> Message {
    if let serde_json::Value::Object(map) = &mut extra {
        map.insert("event".to_string(), json!(event));
    }
    Message::new(MessageType::Broadcast, None, extra)
}

/// The composition root: client registry, dispatch, tick, pause/resume,
/// shutdown. Shared behind an `Arc` by the listener and the tick task.
pub struct RailCore {
    config: AppConfig,
    pool: SqlitePool,
    clients: DashMap<ClientId, Client>,
    kuramoto: RwLock<KuramotoEngine>,
    auth: AuthRegistry,
    absorption: Mutex<AbsorptionTable>,
    rate_limiter: RateLimiter,
    sink: broadcast::Sender<Outbound>,
    messages_processed: AtomicU64,
    message_seq: AtomicU64,
    paused: AtomicBool,
    pause_queue: Mutex<VecDeque<Message>>,
    pause_snapshot: Mutex<Option<(std::collections::HashMap<String, f64>, f64)>>,
    stopped: AtomicBool,
    firewall_blocks: AtomicU64,
}

impl RailCore {
    #[must_use]
    pub fn new(config: AppConfig, pool: SqlitePool) -> Self {
        let (sink, _rx) = broadcast::channel(1024);
        let kuramoto = KuramotoEngine::new(config.kuramoto);
        let auth = AuthRegistry::new(config.auth.clone());
        let rate_limiter = RateLimiter::new(config.rate_limiter);
        Self {
            config,
            pool,
            clients: DashMap::new(),
            kuramoto: RwLock::new(kuramoto),
            auth,
            absorption: Mutex::new(AbsorptionTable::new()),
            rate_limiter,
            sink,
            messages_processed: AtomicU64::new(0),
            message_seq: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            pause_queue: Mutex::new(VecDeque::new()),
            pause_snapshot: Mutex::new(None),
            stopped: AtomicBool::new(false),
            firewall_blocks: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sink.subscribe()
    }

    #[must_use]
    pub fn auth(&self) -> &AuthRegistry {
        &self.auth
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connected_agent_ids(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.agent_id.to_string()).collect()
    }

    fn find_by_agent_id(&self, agent_id: &AgentId) -> Option<ClientId> {
        self.clients.iter().find(|c| &c.agent_id == agent_id).map(|c| c.client_id)
    }

    fn next_seq(&self) -> MessageSeq {
        MessageSeq::from_raw(self.message_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn emit(&self, frame: Outbound) {
        let _ = self.sink.send(frame);
    }

    /// Authenticates (or reconnects) a joining agent, registers its
    /// oscillator and client entry, and issues a fresh reconnect token.
    /// Observers skip authentication entirely and never receive a
    /// reconnect token.
    ///
    /// # Errors
    ///
    /// Returns `RailError::Auth` if neither a valid auth token nor a
    /// valid reconnect token is presented while auth is required, or
    /// `RailError::RateLimit` if the agent has exceeded its join rate.
    pub async fn handle_join(&self, req: JoinRequest) -> Result<JoinOutcome, RailError> {
        // Agents presenting credentials (a valid HMAC token or reconnect
        // token) are already-enrolled members and bypass the absorption
        // pipeline entirely, getting baseline capabilities immediately.
        // Only a credential-less join (permitted when auth is not
        // required) is a genuine absorption candidate.
        let mut via_credentials = true;
        let agent_id = if req.is_observer {
            req.agent_id
        } else if !self.rate_limiter.allow_join(&req.agent_id) {
            return Err(crate::error::RateLimitError::Exceeded { category: "join" }.into());
        } else if let Some(token) = &req.auth_token {
            self.auth.validate_token(token)?
        } else if let Some(token) = &req.reconnect_token {
            self.auth.consume_reconnect_token(token)?
        } else if self.config.auth.auth_required {
            return Err(AuthError::UnknownAgent.into());
        } else {
            via_credentials = false;
            req.agent_id
        };

        {
            let mut engine = self.kuramoto.write().await;
            engine.register(
                agent_id.clone(),
                crate::domain_types::FrequencyHz::try_new(1.0).expect("1.0 is finite"),
                Phase::default(),
                None,
            );
        }

        let capabilities = if !req.is_observer && !via_credentials {
            let mut absorption = self.absorption.lock().unwrap();
            absorption.observe(agent_id.clone(), None);
            stage_capabilities(AbsorptionStage::Observed)
        } else {
            stage_capabilities_baseline()
        };

        let now = Utc::now();
        let client = Client {
            client_id: req.client_id,
            agent_id: agent_id.clone(),
            agent_name: req.agent_name.clone(),
            platform: req.platform.clone(),
            capabilities,
            phase: 0.0,
            frequency: 1.0,
            coherence_contribution: 0.0,
            connected_at: now,
            last_heartbeat: now,
        };
        self.clients.insert(req.client_id, client);

        let reconnect_token =
            if req.is_observer { None } else { Some(self.auth.issue_reconnect_token(agent_id.clone())) };

        if let Err(e) = repository::log_client_action(
            &self.pool,
            agent_id.to_string().as_str(),
            req.agent_name.as_ref().map(std::string::ToString::to_string).as_deref(),
            req.platform.as_deref(),
            "join",
        )
        .await
        {
            warn!(error = %e, "failed to persist client join");
        }

        let (coherence, _mean_phase) = self.kuramoto.read().await.order_parameter();

        self.emit(Outbound::Broadcast(event_message(
            "agent_joined",
            json!({ "agentId": agent_id.to_string(), "clientId": req.client_id.to_string() }),
        )));

        Ok(JoinOutcome {
            client_id: req.client_id,
            agent_id,
            reconnect_token,
            coherence,
            agents: self.connected_agent_ids(),
        })
    }

    /// The dispatcher's single entry point for every inbound frame after
    /// join. Increments `messages_processed` unconditionally; checks the
    /// per-category sliding window for everything but heartbeats, purging
    /// the agent's limiter state and returning
    /// [`ProcessOutcome::RateLimited`] on violation — the caller (the
    /// listener) is responsible for closing the socket. If paused and the
    /// frame is not a heartbeat, enqueues it for replay on resume instead
    /// of handling it now.
    pub async fn process_message(&self, client_id: ClientId, message: Message) -> ProcessOutcome {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        crate::observability::record_message_processed();

        if message.message_type != MessageType::Heartbeat {
            let agent_id = self.clients.get(&client_id).map(|c| c.agent_id.clone());
            if let Some(agent_id) = &agent_id {
                let allowed = match message.message_type {
                    MessageType::Broadcast => self.rate_limiter.allow_broadcast(agent_id),
                    _ => self.rate_limiter.allow_message(agent_id),
                };
                if !allowed {
                    self.rate_limiter.purge(agent_id);
                    return ProcessOutcome::RateLimited;
                }
            }
        }

        if self.paused.load(Ordering::SeqCst) && message.message_type != MessageType::Heartbeat {
            let mut queue = self.pause_queue.lock().unwrap();
            if queue.len() >= PAUSE_QUEUE_CAP {
                warn!("pause queue full, dropping frame");
            } else {
                queue.push_back(message);
            }
            return ProcessOutcome::Accepted;
        }

        self.dispatch(client_id, &message).await;

        let payload_str = message.payload.to_string();
        match repository::log_message(
            &self.pool,
            message_type_label(message.message_type),
            message.agent_id.as_ref().map(std::string::ToString::to_string).as_deref(),
            message.agent_name.as_ref().map(std::string::ToString::to_string).as_deref(),
            &message.payload,
        )
        .await
        {
            Ok(seq) => {
                self.message_seq.store(seq.value(), Ordering::SeqCst);
            }
            Err(e) => {
                warn!(error = %e, payload_len = payload_str.len(), "failed to persist message log entry");
                self.next_seq();
            }
        }

        ProcessOutcome::Accepted
    }

    async fn dispatch(&self, client_id: ClientId, message: &Message) {
        match message.message_type {
            MessageType::Heartbeat => self.handle_heartbeat(client_id),
            MessageType::Leave => self.handle_leave(client_id).await,
            MessageType::Coherence => self.handle_coherence(client_id, message).await,
            MessageType::Message => self.handle_routable(client_id, message).await,
            MessageType::Broadcast => self.handle_broadcast(message),
            MessageType::Trace => self.handle_trace(message).await,
            MessageType::Search => self.handle_search(client_id, message).await,
            MessageType::Synthesize => self.handle_synthesize(client_id, message).await,
            MessageType::Replay => self.handle_replay(client_id, message).await,
            // Join is handled by `handle_join` before a frame ever reaches
            // here; sync/metadata are server-to-client only. Migrate has
            // no further semantics defined beyond appearing in the closed
            // envelope type set, so it passes through as a no-op.
            MessageType::Join | MessageType::Sync | MessageType::Migrate | MessageType::Metadata => {}
        }
    }

    fn handle_heartbeat(&self, client_id: ClientId) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.last_heartbeat = Utc::now();
        }
    }

    async fn handle_leave(&self, client_id: ClientId) {
        if let Some((_, client)) = self.clients.remove(&client_id) {
            self.kuramoto.write().await.remove(&client.agent_id);
            self.absorption.lock().unwrap().remove(&client.agent_id);
            self.rate_limiter.purge(&client.agent_id);
            if let Err(e) =
                repository::log_client_action(&self.pool, client.agent_id.to_string().as_str(), None, None, "leave")
                    .await
            {
                warn!(error = %e, "failed to persist client leave");
            }
            self.emit(Outbound::Broadcast(event_message(
                "agent_left",
                json!({ "agentId": client.agent_id.to_string() }),
            )));
        }
    }

    async fn handle_coherence(&self, client_id: ClientId, message: &Message) {
        let Some(phase_value) = message.payload.get("phase").and_then(serde_json::Value::as_f64) else {
            return;
        };
        let Some(client) = self.clients.get(&client_id).map(|c| c.agent_id.clone()) else {
            return;
        };
        self.kuramoto.write().await.report_phase(&client, Phase::wrapped(phase_value));
        if let Some(mut c) = self.clients.get_mut(&client_id) {
            c.phase = phase_value;
        }
    }

    async fn handle_routable(&self, client_id: ClientId, message: &Message) {
        let Some(text) = message.payload.get("content").and_then(serde_json::Value::as_str) else {
            return;
        };
        if firewall::process(self.config.firewall.profile, text).is_err() {
            self.firewall_blocks.fetch_add(1, Ordering::Relaxed);
            crate::observability::record_firewall_block();
            let _ = repository::log_event(
                &self.pool,
                "firewall:blocked",
                Some(client_id.to_string().as_str()),
                &json!({}),
            )
            .await;
            return;
        }

        let candidates: Vec<Candidate> = self
            .clients
            .iter()
            .filter(|c| c.client_id != client_id)
            .map(|c| Candidate {
                agent_id: c.agent_id.clone(),
                load: 0.0,
                coherence: c.coherence_contribution,
                attractor: None,
            })
            .collect();

        let embedding = message
            .payload
            .get("embedding")
            .and_then(serde_json::Value::as_array)
            .map(|arr| EmbeddingVector::new(arr.iter().filter_map(serde_json::Value::as_f64).map(|v| v as f32).collect()));

        self.observe_absorption_interaction(message.agent_id.as_ref(), embedding.as_ref());

        if let Ok(target_agent) = router::route(&self.config.router, &candidates, embedding.as_ref()) {
            if let Some(target_client) = self.find_by_agent_id(&target_agent) {
                self.emit(Outbound::Unicast(target_client, message.clone()));
            }
        }
    }

    /// Records a further interaction against an existing absorption
    /// candidate. A no-op for agents that never entered the pipeline
    /// (credentialed joins), so this never accidentally enrolls an
    /// already-trusted client as a candidate.
    fn observe_absorption_interaction(&self, agent_id: Option<&AgentId>, embedding: Option<&EmbeddingVector>) {
        let Some(agent_id) = agent_id else { return };
        let mut absorption = self.absorption.lock().unwrap();
        if absorption.get(agent_id).is_some() {
            absorption.observe(agent_id.clone(), embedding.cloned());
        }
    }

    fn handle_broadcast(&self, message: &Message) {
        self.emit(Outbound::Broadcast(message.clone()));
    }

    async fn handle_trace(&self, message: &Message) {
        let Some(content) = message.payload.get("content").and_then(serde_json::Value::as_str) else {
            return;
        };
        let kind = message.payload.get("kind").and_then(serde_json::Value::as_str).unwrap_or("note");
        let embedding = message
            .payload
            .get("embedding")
            .and_then(serde_json::Value::as_array)
            .map(|arr| EmbeddingVector::new(arr.iter().filter_map(serde_json::Value::as_f64).map(|v| v as f32).collect()));
        self.observe_absorption_interaction(message.agent_id.as_ref(), embedding.as_ref());

        let id = Uuid::new_v4().to_string();
        if let Err(e) = repository::insert_trace(
            &self.pool,
            &id,
            message.agent_id.as_ref().map(std::string::ToString::to_string).unwrap_or_default().as_str(),
            message.agent_name.as_ref().map(std::string::ToString::to_string).as_deref(),
            content,
            embedding.as_ref(),
            kind,
            &message.payload.get("metadata").cloned().unwrap_or(serde_json::Value::Null),
        )
        .await
        {
            warn!(error = %e, "failed to persist trace");
        }
    }

    async fn handle_search(&self, client_id: ClientId, message: &Message) {
        let agent_filter = message.payload.get("agentId").and_then(serde_json::Value::as_str);
        let limit = message.payload.get("limit").and_then(serde_json::Value::as_i64).unwrap_or(20);
        match repository::search_traces(&self.pool, agent_filter, limit).await {
            Ok(traces) => {
                let payload = json!({
                    "traces": traces.iter().map(|t| json!({
                        "id": t.id, "agentId": t.agent_id, "content": t.content, "kind": t.kind,
                    })).collect::<Vec<_>>(),
                });
                self.emit(Outbound::Unicast(client_id, Message::new(MessageType::Search, None, payload)));
            }
            Err(e) => warn!(error = %e, "trace search failed"),
        }
    }

    async fn handle_synthesize(&self, client_id: ClientId, message: &Message) {
        let agent_filter = message.payload.get("agentId").and_then(serde_json::Value::as_str);
        let limit = message.payload.get("limit").and_then(serde_json::Value::as_i64).unwrap_or(5) as usize;
        let query = message
            .payload
            .get("embedding")
            .and_then(serde_json::Value::as_array)
            .map(|arr| EmbeddingVector::new(arr.iter().filter_map(serde_json::Value::as_f64).map(|v| v as f32).collect()));

        let fetch = crate::synthesizer::fetch_limit(limit);
        match repository::search_traces(&self.pool, agent_filter, fetch).await {
            Ok(traces) => {
                let clients = &self.clients;
                let result = crate::synthesizer::rank(&traces, query.as_ref(), limit, |agent_id| {
                    clients
                        .iter()
                        .find(|c| c.agent_id.to_string() == agent_id)
                        .and_then(|c| crate::domain_types::CoherenceContribution::try_new(c.coherence_contribution).ok())
                        .unwrap_or_default()
                });
                let payload = json!({ "summary": result.summary, "count": result.traces.len() });
                self.emit(Outbound::Unicast(client_id, Message::new(MessageType::Synthesize, None, payload)));
            }
            Err(e) => warn!(error = %e, "synthesis failed"),
        }
    }

    async fn handle_replay(&self, client_id: ClientId, message: &Message) {
        let since = message.payload.get("sinceSeq").and_then(serde_json::Value::as_u64).unwrap_or(0);
        match repository::load_message_log_since(&self.pool, since).await {
            Ok(entries) => {
                let payload = json!({ "count": entries.len() });
                self.emit(Outbound::Unicast(client_id, Message::new(MessageType::Replay, None, payload)));
            }
            Err(e) => warn!(error = %e, "replay load failed"),
        }
    }

    /// Advances the Kuramoto engine by one step, persists a coherence
    /// sample, sweeps clients whose `last_heartbeat` has gone stale
    /// (independent of the engine's own phase-report staleness sweep),
    /// cleans expired reconnect tokens, and forces a synchronizing nudge
    /// if the order parameter is too low.
    pub async fn tick(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let report = {
            let mut engine = self.kuramoto.write().await;
            engine.tick(self.config.kuramoto.tick_interval_ms)
        };

        for agent_id in &report.removed_stale {
            if let Some(client_id) = self.find_by_agent_id(agent_id) {
                self.handle_leave(client_id).await;
            }
        }

        let heartbeat_ttl =
            chrono::Duration::seconds(i64::try_from(self.config.kuramoto.stale_ttl_secs).unwrap_or(30));
        let now = Utc::now();
        let stale_heartbeats: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| now.signed_duration_since(c.last_heartbeat) > heartbeat_ttl)
            .map(|c| c.client_id)
            .collect();
        for client_id in stale_heartbeats {
            self.handle_leave(client_id).await;
        }

        if let Err(e) = repository::log_coherence(
            &self.pool,
            report.order_parameter.into_inner(),
            i64::try_from(self.clients.len()).unwrap_or(i64::MAX),
            report.mean_phase.radians(),
        )
        .await
        {
            warn!(error = %e, "failed to persist coherence sample");
        }

        self.auth.sweep_expired_reconnect_tokens();
        self.advance_absorption_candidates();

        if report.order_parameter.into_inner() < self.config.kuramoto.coherence_threshold {
            let mut engine = self.kuramoto.write().await;
            engine.force_synchronize(INTERVENTION_FRACTION);
            drop(engine);
            self.emit(Outbound::Broadcast(event_message("sync", json!({ "reason": "low_coherence" }))));
        }

        crate::observability::set_order_parameter(report.order_parameter.into_inner());
        crate::observability::set_connections_active(self.clients.len());
    }

    /// Drives the absorption stage machine forward for every candidate
    /// that is also a connected client. There is no wire-level invite/
    /// accept message type (§4.5 calls `observed`/`assessed`/`invited`
    /// "server-driven stage advancement only"), so every step past
    /// `assessed` — invite, accept, begin syncing, absorb — is taken here
    /// automatically, one stage per tick, with the corresponding client's
    /// capabilities updated to match the stage reached.
    fn advance_absorption_candidates(&self) {
        let agent_ids: Vec<AgentId> = self.clients.iter().map(|c| c.agent_id.clone()).collect();
        let mut absorption = self.absorption.lock().unwrap();
        for agent_id in agent_ids {
            let Some(stage) = absorption.get(&agent_id).map(|c| c.stage) else { continue };
            let advanced = match stage {
                AbsorptionStage::Assessed => absorption.invite_candidate(&agent_id).map(|()| AbsorptionStage::Invited),
                AbsorptionStage::Invited => absorption.accept_invitation(&agent_id).map(|()| AbsorptionStage::Connected),
                AbsorptionStage::Connected => absorption.begin_syncing(&agent_id).map(|()| AbsorptionStage::Syncing),
                AbsorptionStage::Syncing => absorption.absorb(&agent_id).map(|()| AbsorptionStage::Absorbed),
                AbsorptionStage::Observed | AbsorptionStage::Absorbed => continue,
            };
            if let Ok(stage) = advanced {
                if let Some(client_id) = self.find_by_agent_id(&agent_id) {
                    if let Some(mut client) = self.clients.get_mut(&client_id) {
                        client.capabilities = stage_capabilities(stage);
                    }
                }
            }
        }
    }

    /// Stops the ticker conceptually (callers stop polling `tick`),
    /// snapshots every client's phase, and persists the snapshot.
    /// Repeated calls return the existing snapshot without resetting it.
    pub async fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let phases: std::collections::HashMap<String, f64> =
            self.clients.iter().map(|c| (c.agent_id.to_string(), c.phase)).collect();
        let (coherence, _) = self.kuramoto.read().await.order_parameter();
        let coherence = coherence.into_inner();
        *self.pause_snapshot.lock().unwrap() = Some((phases.clone(), coherence));
        if let Err(e) = repository::save_pause_snapshot(&self.pool, &phases, coherence).await {
            warn!(error = %e, "failed to persist pause snapshot");
        }
    }

    /// Restores snapshotted phases, drains the pause queue in FIFO order
    /// through `process_message`, and clears the snapshot. No-op if not
    /// currently paused.
    pub async fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((phases, _)) = self.pause_snapshot.lock().unwrap().take() {
            for mut client in self.clients.iter_mut() {
                if let Some(phase) = phases.get(&client.agent_id.to_string()) {
                    client.phase = *phase;
                }
            }
        }
        let drained: Vec<Message> = {
            let mut queue = self.pause_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for message in drained {
            if let Some(client_id) = message.agent_id.as_ref().and_then(|id| self.find_by_agent_id(id)) {
                self.dispatch(client_id, &message).await;
            }
        }
    }

    /// Idempotent shutdown. If `grace_ms > 0`, broadcasts `go_away` with
    /// the remaining grace period before the final `server_shutdown`
    /// broadcast; otherwise emits `server_shutdown` immediately. A second
    /// call is a no-op.
    pub fn stop(&self, grace_ms: u64) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if grace_ms > 0 {
            self.emit(Outbound::Broadcast(event_message(
                "go_away",
                json!({ "timeRemainingMs": grace_ms }),
            )));
        }
        self.emit(Outbound::Broadcast(event_message("server_shutdown", json!({}))));
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Synthesizes a leave for `client_id` when the transport closes
    /// without an explicit `leave` frame (socket drop, stale-heartbeat
    /// sweep).
    pub async fn disconnect(&self, client_id: ClientId) {
        self.handle_leave(client_id).await;
    }

    /// Gathers everything the metadata broadcaster (C9) needs for one
    /// cycle from the client registry, the Kuramoto engine, and the
    /// absorption table. `external_agent_count` is supplied by the
    /// listener, which is the only component that tracks observer
    /// connections.
    pub async fn metadata_snapshot_input(&self, external_agent_count: u32) -> crate::broadcaster::SnapshotInput {
        let mut platform_counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        let mut coherence_contributions: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for client in &self.clients {
            let platform = client.platform.clone().unwrap_or_else(|| "unknown".to_string());
            *platform_counts.entry(platform).or_insert(0) += 1;
            coherence_contributions.insert(client.agent_id.to_string(), client.coherence_contribution);
        }

        let absorption_stage_counts = self.absorption.lock().unwrap().stage_counts();

        let engine = self.kuramoto.read().await;
        let (order_parameter, mean_phase) = engine.order_parameter();
        let trust_scores = engine.trust_scores();
        let oscillator_phases = engine.oscillator_phases();
        let per_model_order_parameters = engine.per_model_order_parameters();
        let has_model_types = engine.has_model_types();
        drop(engine);

        crate::broadcaster::SnapshotInput {
            platform_counts,
            absorption_stage_counts,
            coherence_contributions,
            trust_scores,
            order_parameter,
            mean_phase: mean_phase.radians(),
            oscillator_phases,
            per_model_order_parameters,
            has_model_types,
            external_agent_count,
            firewall_blocks_total: self.firewall_blocks.load(Ordering::Relaxed),
        }
    }

    /// Broadcasts a pre-built metadata payload (from
    /// [`metadata_snapshot_input`](Self::metadata_snapshot_input) and
    /// [`crate::broadcaster::build_snapshot`]) to every connected client.
    pub fn broadcast_metadata(&self, payload: serde_json::Value) {
        self.emit(Outbound::Broadcast(Message::new(MessageType::Metadata, None, payload)));
    }
}

fn message_type_label(t: MessageType) -> &'static str {
    match t {
        MessageType::Join => "join",
        MessageType::Leave => "leave",
        MessageType::Heartbeat => "heartbeat",
        MessageType::Coherence => "coherence",
        MessageType::Message => "message",
        MessageType::Broadcast => "broadcast",
        MessageType::Sync => "sync",
        MessageType::Migrate => "migrate",
        MessageType::Metadata => "metadata",
        MessageType::Trace => "trace",
        MessageType::Search => "search",
        MessageType::Synthesize => "synthesize",
        MessageType::Replay => "replay",
    }
}
