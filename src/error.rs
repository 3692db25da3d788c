//! Crate-wide error taxonomy.
//!
//! Each component publishes its own error enum; `RailError` folds them
//! together at the seams where the Rail Core composes components, and is
//! the only error type that crosses the public API boundary (`RailServer`
//! construction and `run`). No component error reaches a connected client
//! as a message body — see `listener::close_code_for` for the mapping from
//! error to wire-level close code.

use thiserror::Error;

/// Errors raised by the HMAC challenge/response auth protocol (C3).
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no secret registered for agent")]
    UnknownAgent,
    #[error("token timestamp outside freshness window")]
    StaleToken,
    #[error("signature mismatch")]
    BadSignature,
    #[error("reconnect token not found or already consumed")]
    InvalidReconnectToken,
    #[error("reconnect token expired")]
    ExpiredReconnectToken,
    #[error("malformed auth token: {0}")]
    Malformed(String),
}

/// Errors raised by the thermodynamic router (C2).
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no candidate destinations available")]
    NoCandidates,
    #[error("invalid routing weights: {0}")]
    InvalidConfig(String),
}

/// Errors raised by the persistence layer (C6).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("data directory could not be created: {0}")]
    DataDir(String),
}

/// Errors raised by the absorption protocol (C5).
#[derive(Debug, Error)]
pub enum AbsorptionError {
    #[error("candidate is already connected to the client registry")]
    AlreadyConnected,
    #[error("invalid stage transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("candidate has not met the interaction/alignment threshold")]
    ThresholdNotMet,
}

/// Errors raised by the firewall / injection guard (C4).
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("payload blocked: score {score:.2} exceeds profile threshold {threshold:.2}")]
    Blocked { score: f64, threshold: f64 },
}

/// Errors raised by the rate limiter (C10).
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for category {category}")]
    Exceeded { category: &'static str },
}

/// Errors raised by the Kuramoto engine (C1) at configuration time. The
/// engine never fails at tick time — malformed input is rejected silently,
/// per the source's "the engine never fails" rule.
#[derive(Debug, Error)]
pub enum KuramotoError {
    #[error("invalid coupling bounds: K_min {k_min} > K_max {k_max}")]
    InvalidCouplingBounds { k_min: f64, k_max: f64 },
}

/// Top-level error type used at the public crate API boundary.
///
/// This is what `main.rs` and integration tests see; connected clients
/// never see any of this, only a WebSocket close code.
#[derive(Debug, Error)]
pub enum RailError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Absorption(#[from] AbsorptionError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Kuramoto(#[from] KuramotoError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate's public functions.
pub type RailResult<T> = Result<T, RailError>;
