//! Application configuration.
//!
//! `AppConfig` aggregates one nested `*Config` struct per component. Each
//! nested config has a `default()` matching the numeric defaults named
//! throughout the component design, and `from_env()` overlays the
//! environment variables named in the external interfaces section.
//! `AppConfig::validate()` rejects out-of-range combinations at startup
//! rather than at first tick.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration validation failures, surfaced before the server binds a
/// socket or opens the database.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub kuramoto: KuramotoConfig,
    pub router: RouterConfig,
    pub auth: AuthConfig,
    pub firewall: FirewallConfig,
    pub storage: StorageConfig,
    pub rate_limiter: RateLimiterConfig,
    pub broadcaster: BroadcasterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            kuramoto: KuramotoConfig::default(),
            router: RouterConfig::default(),
            auth: AuthConfig::default(),
            firewall: FirewallConfig::default(),
            storage: StorageConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            broadcaster: BroadcasterConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration by taking `default()` and overlaying the
    /// environment variables named in the external interfaces section.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration fails `validate()`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                config.server.port = port;
            }
        }
        if let Ok(val) = std::env::var("RAIL_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RAIL_ADMIN_SECRET") {
            config.auth.admin_secret = val;
        }
        if let Ok(val) = std::env::var("RAIL_AUTH_REQUIRED") {
            config.auth.auth_required = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field invariants that a single nested config cannot
    /// check on its own (e.g. `K_min <= K_max`).
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError::Validation` describing the first invariant
    /// violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kuramoto.k_min > self.kuramoto.k_max {
            return Err(ConfigError::Validation {
                field: "kuramoto.k_min".to_string(),
                reason: format!(
                    "k_min ({}) must not exceed k_max ({})",
                    self.kuramoto.k_min, self.kuramoto.k_max
                ),
            });
        }
        if self.kuramoto.coherence_threshold >= self.kuramoto.groupthink_threshold {
            return Err(ConfigError::Validation {
                field: "kuramoto.coherence_threshold".to_string(),
                reason: "coherence_threshold must be below groupthink_threshold".to_string(),
            });
        }
        if self.router.temperature <= 0.0 {
            return Err(ConfigError::Validation {
                field: "router.temperature".to_string(),
                reason: "temperature must be > 0".to_string(),
            });
        }
        let weight_sum = self.router.w_load + self.router.w_coh + self.router.w_sem;
        if (weight_sum - 1.0).abs() > 0.05 {
            return Err(ConfigError::Validation {
                field: "router.weights".to_string(),
                reason: format!("w_load + w_coh + w_sem should sum to ~1.0, got {weight_sum}"),
            });
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Validation {
                field: "server.max_connections".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Listener bind address, port, and connection caps (C11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_observers: usize,
    pub heartbeat_interval_ms: u64,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 200,
            max_observers: 50,
            heartbeat_interval_ms: 10_000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Phase-synchronization engine tunables (C1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KuramotoConfig {
    pub k_initial: f64,
    pub k_min: f64,
    pub k_max: f64,
    pub k_step: f64,
    pub coherence_threshold: f64,
    pub groupthink_threshold: f64,
    pub cross_model_attenuation: f64,
    pub tick_interval_ms: u64,
    pub stale_ttl_secs: u64,
    pub flood_window_ms: u64,
    pub flood_max_reports: u32,
    pub flood_trust_penalty: f64,
}

impl Default for KuramotoConfig {
    fn default() -> Self {
        Self {
            k_initial: 0.7,
            k_min: 0.1,
            k_max: 2.0,
            k_step: 0.05,
            coherence_threshold: 0.35,
            groupthink_threshold: 0.95,
            cross_model_attenuation: 0.7,
            tick_interval_ms: 100,
            stale_ttl_secs: 30,
            flood_window_ms: 1_000,
            flood_max_reports: 10,
            flood_trust_penalty: 0.1,
        }
    }
}

/// Thermodynamic router weights and temperature (C2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterConfig {
    pub w_load: f64,
    pub w_coh: f64,
    pub w_sem: f64,
    pub temperature: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            w_load: 0.2,
            w_coh: 0.4,
            w_sem: 0.4,
            temperature: 0.8,
        }
    }
}

/// HMAC auth protocol tunables (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub max_token_age_secs: i64,
    pub reconnect_ttl_secs: i64,
    pub admin_secret: String,
    pub auth_required: bool,
    pub observer_platforms: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_token_age_secs: 30,
            reconnect_ttl_secs: 300,
            admin_secret: String::new(),
            auth_required: true,
            observer_platforms: vec![
                "moltyverse".to_string(),
                "observer".to_string(),
                "browser-runtime".to_string(),
            ],
        }
    }
}

/// Injection-guard profile and pattern weights (C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallProfile {
    Paranoid,
    Standard,
    Relaxed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    pub profile: FirewallProfile,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            profile: FirewallProfile::Standard,
        }
    }
}

/// Persistence layer tunables (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_connections: 5,
        }
    }
}

/// Sliding-window sizes per rate-limited category (C10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub join_limit: u32,
    pub join_window_ms: u64,
    pub message_limit: u32,
    pub message_window_ms: u64,
    pub broadcast_limit: u32,
    pub broadcast_window_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            join_limit: 5,
            join_window_ms: 60_000,
            message_limit: 100,
            message_window_ms: 1_000,
            broadcast_limit: 10,
            broadcast_window_ms: 1_000,
        }
    }
}

/// Metadata broadcaster cadence (C9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    pub interval_ms: u64,
    pub full_snapshot_every: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            full_snapshot_every: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_coupling_bounds_rejected() {
        let mut config = AppConfig::default();
        config.kuramoto.k_min = 5.0;
        config.kuramoto.k_max = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.router.temperature = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_env_overlays_port() {
        // SAFETY: test runs single-threaded within this module's test harness
        unsafe {
            std::env::set_var("PORT", "9999");
        }
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 9999);
        unsafe {
            std::env::remove_var("PORT");
        }
    }
}
