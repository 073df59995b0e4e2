// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Pool sizing lives in `db::pool::PoolConfig`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::coalesce::CoalesceConfig;

const DEFAULT_PORT: u16 = 1234;
const DEFAULT_FRAGMENT_NAME: &str = "prosemirror";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Without one, snapshots stay in memory.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `folio_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Name of the root XML fragment holding the rich-text tree.
    pub fragment_name: String,
    /// Debounce window and wait cap for coalesced snapshot writes.
    pub coalesce: CoalesceConfig,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FOLIO_RELAY_HOST` | `0.0.0.0` |
    /// | `FOLIO_RELAY_PORT` (then `PORT`) | `1234` |
    /// | `FOLIO_RELAY_DATABASE_URL` (then `DATABASE_URL`) | *(none)* |
    /// | `FOLIO_RELAY_LOG_FILTER` | `info` |
    /// | `FOLIO_RELAY_LOG_FORMAT` | `text` |
    /// | `FOLIO_RELAY_FRAGMENT_NAME` | `prosemirror` |
    /// | `FOLIO_RELAY_DEBOUNCE_MS` | `3000` |
    /// | `FOLIO_RELAY_MAX_WAIT_MS` | `10000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FOLIO_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("FOLIO_RELAY_PORT")
            .or_else(|_| env("PORT"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("FOLIO_RELAY_DATABASE_URL")
            .or_else(|_| env("DATABASE_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty());

        let log_filter = env("FOLIO_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("FOLIO_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let fragment_name = env("FOLIO_RELAY_FRAGMENT_NAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_FRAGMENT_NAME.into());

        let defaults = CoalesceConfig::default();
        let millis = |key: &str, default: Duration| {
            env(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let coalesce = CoalesceConfig::new(
            millis("FOLIO_RELAY_DEBOUNCE_MS", defaults.quiet),
            millis("FOLIO_RELAY_MAX_WAIT_MS", defaults.max_wait),
        );

        Self { listen_addr, database_url, log_filter, log_format, fragment_name, coalesce }
    }
}
