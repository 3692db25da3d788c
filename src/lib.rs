//! # Resonance Rail
//!
//! A physics-inspired coordination hub for heterogeneous autonomous
//! agents. Agents join over WebSocket, synchronize through a coupled-
//! oscillator (Kuramoto) model, exchange messages routed by a
//! thermodynamic cost function, and persist reasoning traces the hub can
//! later recall and synthesize by similarity.
//!
//! ## Composition
//!
//! [`rail_core::RailCore`] is the composition root: it owns the client
//! registry, the dispatch loop, and the pause/resume/shutdown state
//! machine, and holds the [`kuramoto::KuramotoEngine`],
//! [`auth_protocol::AuthRegistry`], [`absorption::AbsorptionTable`], and
//! [`rate_limiter::RateLimiter`] as components it consults on the
//! client's behalf. [`listener`] owns the sockets and the HTTP admin
//! surface; the two are linked only by `ClientId` values, never by
//! reference, so the listener's transport lifecycle and the core's
//! logical lifecycle can evolve independently. [`server::run`] wires the
//! whole thing together: it opens the database, restores enrollments,
//! spawns the tick loop and metadata broadcaster as independent tasks,
//! and binds the shared axum router.
//!
//! ## Module map
//!
//! | Module | Component |
//! |---|---|
//! | [`kuramoto`] | C1 — phase-synchronization engine |
//! | [`router`] | C2 — thermodynamic message router |
//! | [`auth_protocol`] | C3 — HMAC challenge/response, reconnect tokens |
//! | [`firewall`] | C4 — pattern-based injection guard |
//! | [`absorption`] | C5 — staged admission pipeline |
//! | [`storage`] | C6 — embedded SQLite persistence |
//! | [`synthesizer`] | C7 — similarity + coherence trace ranking |
//! | [`rail_core`] | C8 — client registry, dispatch, tick, pause/resume |
//! | [`broadcaster`] | C9 — periodic metadata snapshot/diff |
//! | [`rate_limiter`] | C10 — per-agent sliding-window limits |
//! | [`listener`] | C11 — WebSocket + HTTP admin surface |

pub mod absorption;
pub mod auth_protocol;
pub mod broadcaster;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod firewall;
pub mod kuramoto;
pub mod listener;
pub mod message;
pub mod observability;
pub mod rail_core;
pub mod rate_limiter;
pub mod router;
pub mod server;
pub mod storage;
pub mod synthesizer;

pub use config::AppConfig;
pub use error::{RailError, RailResult};
pub use rail_core::RailCore;
