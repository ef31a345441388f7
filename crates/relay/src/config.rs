// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Collaboration tunables live in `CollabConfig` so the hub can be
// built in tests without touching the environment.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

const DEV_JWT_SECRET: &str = "easel_local_development_jwt_secret_must_be_32_chars";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HMAC secret used to verify connection credentials.
    pub jwt_secret: String,
    /// PostgreSQL connection string. When absent, cross-instance fan-out
    /// uses the in-process broker (single instance deployments).
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `easel_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Identifier stamped on every envelope this instance publishes.
    pub instance_id: String,
    /// How often the presence sweeper runs.
    pub sweep_interval: Duration,
    pub collab: CollabConfig,
}

/// Tunables for rooms, the transform engine and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollabConfig {
    /// Per-element window during which concurrent writes are arbitrated.
    pub conflict_window_ms: i64,
    /// Presences silent for longer than this are expired and their locks freed.
    pub presence_ttl_ms: i64,
    /// Empty rooms are dropped after this long.
    pub room_grace_ms: i64,
    /// Outbound queue soft capacity per connection.
    pub outbound_buffer: usize,
    /// Maximum undo entries kept per user per room.
    pub history_depth: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            conflict_window_ms: 500,
            presence_ttl_ms: 30_000,
            room_grace_ms: 10_000,
            outbound_buffer: 256,
            history_depth: 100,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `EASEL_RELAY_HOST` | `0.0.0.0` |
    /// | `EASEL_RELAY_PORT` | `8080` |
    /// | `EASEL_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `EASEL_RELAY_DATABASE_URL` | *(none, in-process broker)* |
    /// | `EASEL_RELAY_LOG_FILTER` | `info` |
    /// | `EASEL_RELAY_LOG_JSON` | `false` |
    /// | `EASEL_RELAY_INSTANCE_ID` | random UUID |
    /// | `EASEL_RELAY_CONFLICT_WINDOW_MS` | `500` |
    /// | `EASEL_RELAY_PRESENCE_TTL_MS` | `30000` |
    /// | `EASEL_RELAY_ROOM_GRACE_MS` | `10000` |
    /// | `EASEL_RELAY_SWEEP_INTERVAL_MS` | `5000` |
    /// | `EASEL_RELAY_OUTBOUND_BUFFER` | `256` |
    /// | `EASEL_RELAY_HISTORY_DEPTH` | `100` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("EASEL_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("EASEL_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("EASEL_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("EASEL_RELAY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let log_filter = env("EASEL_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("EASEL_RELAY_LOG_JSON")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let instance_id = env("EASEL_RELAY_INSTANCE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let defaults = CollabConfig::default();
        let positive_ms = |key: &str, default: i64| {
            env(key).ok().and_then(|v| v.parse::<i64>().ok()).filter(|v| *v > 0).unwrap_or(default)
        };
        let positive_count = |key: &str, default: usize| {
            env(key).ok().and_then(|v| v.parse::<usize>().ok()).filter(|v| *v > 0).unwrap_or(default)
        };

        let sweep_interval_ms = positive_ms("EASEL_RELAY_SWEEP_INTERVAL_MS", 5_000);
        let collab = CollabConfig {
            conflict_window_ms: positive_ms(
                "EASEL_RELAY_CONFLICT_WINDOW_MS",
                defaults.conflict_window_ms,
            ),
            presence_ttl_ms: positive_ms("EASEL_RELAY_PRESENCE_TTL_MS", defaults.presence_ttl_ms),
            room_grace_ms: positive_ms("EASEL_RELAY_ROOM_GRACE_MS", defaults.room_grace_ms),
            outbound_buffer: positive_count(
                "EASEL_RELAY_OUTBOUND_BUFFER",
                defaults.outbound_buffer,
            ),
            history_depth: positive_count("EASEL_RELAY_HISTORY_DEPTH", defaults.history_depth),
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            log_filter,
            log_json,
            instance_id,
            sweep_interval: Duration::from_millis(sweep_interval_ms as u64),
            collab,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.log_json);
        assert!(Uuid::parse_str(&cfg.instance_id).is_ok());
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.collab, CollabConfig::default());
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_HOST", "127.0.0.1");
        m.insert("EASEL_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn blank_database_url_means_in_process_broker() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_DATABASE_URL", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());

        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_DATABASE_URL", "postgres://u:p@host/db");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db"));
    }

    #[test]
    fn json_logging_flag() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_LOG_JSON", "TRUE");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.log_json);
    }

    #[test]
    fn instance_id_override() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_INSTANCE_ID", "relay-eu-1");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.instance_id, "relay-eu-1");
    }

    #[test]
    fn collab_tunables_override() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_CONFLICT_WINDOW_MS", "250");
        m.insert("EASEL_RELAY_PRESENCE_TTL_MS", "60000");
        m.insert("EASEL_RELAY_ROOM_GRACE_MS", "1000");
        m.insert("EASEL_RELAY_SWEEP_INTERVAL_MS", "750");
        m.insert("EASEL_RELAY_OUTBOUND_BUFFER", "32");
        m.insert("EASEL_RELAY_HISTORY_DEPTH", "10");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.collab.conflict_window_ms, 250);
        assert_eq!(cfg.collab.presence_ttl_ms, 60_000);
        assert_eq!(cfg.collab.room_grace_ms, 1_000);
        assert_eq!(cfg.sweep_interval, Duration::from_millis(750));
        assert_eq!(cfg.collab.outbound_buffer, 32);
        assert_eq!(cfg.collab.history_depth, 10);
    }

    #[test]
    fn non_positive_tunables_use_defaults() {
        let mut m = HashMap::new();
        m.insert("EASEL_RELAY_CONFLICT_WINDOW_MS", "0");
        m.insert("EASEL_RELAY_HISTORY_DEPTH", "-3");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.collab.conflict_window_ms, 500);
        assert_eq!(cfg.collab.history_depth, 100);
    }
}
