//! Gateway configuration, loaded from environment variables at startup and
//! optionally overridden by CLI flags in the binaries.

use std::time::Duration;

/// Offset between the frontend port and the cluster control port.
pub const CONTROL_PORT_OFFSET: u16 = 1000;

/// Highest frontend port that still leaves room for the control port in
/// a `u16`.
pub const MAX_CLUSTER_PORT: u16 = u16::MAX - CONTROL_PORT_OFFSET;

/// Runtime configuration for the gateway.
///
/// Every field has a sensible default so a bare `manifold` invocation
/// works without any environment variables set.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interface to bind (default: `"0.0.0.0"`).
    pub host: String,

    /// Frontend port serving the OpenAI-compatible API (default: 8080).
    /// In cluster mode the control plane listens on `port + 1000`.
    pub port: u16,

    /// Maximum concurrent in-flight POST requests (default: 10).
    pub max_concurrency: usize,

    /// End-to-end budget for a single request; also the provider
    /// inactivity timeout (default: 60 000 ms).
    pub default_timeout_ms: u64,

    /// How long an arriving request may wait for an admission slot before
    /// being rejected with 503 (default: 5 000 ms).
    pub wait_timeout_ms: u64,

    /// Shared bearer token.  `None` disables authentication.
    pub api_key: Option<String>,

    /// `owned_by` value reported by `/v1/models` (default: `"manifold"`).
    pub owner: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,hyper=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS origin allowlist; `None` means wildcard.
    pub cors_allowed_origins: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            max_concurrency: 10,
            default_timeout_ms: 60_000,
            wait_timeout_ms: 5_000,
            api_key: None,
            owner: "manifold".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            cors_allowed_origins: None,
        }
    }
}

impl GatewayConfig {
    /// Build a [`GatewayConfig`] from environment variables, falling back
    /// to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("MANIFOLD_HOST", &defaults.host),
            port: parse_env("MANIFOLD_PORT", defaults.port),
            max_concurrency: parse_env("MANIFOLD_MAX_CONCURRENCY", defaults.max_concurrency),
            default_timeout_ms: parse_env("MANIFOLD_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            wait_timeout_ms: parse_env("MANIFOLD_WAIT_TIMEOUT_MS", defaults.wait_timeout_ms),
            api_key: std::env::var("MANIFOLD_API_KEY").ok().filter(|k| !k.is_empty()),
            owner: env_or("MANIFOLD_OWNER", &defaults.owner),
            log_level: env_or("MANIFOLD_LOG", &defaults.log_level),
            log_json: std::env::var("MANIFOLD_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: std::env::var("MANIFOLD_CORS_ORIGINS").ok(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// The cluster control port paired with this frontend port.
    ///
    /// Saturates rather than wraps on a frontend port above
    /// [`MAX_CLUSTER_PORT`]; cluster entry points reject such ports up
    /// front via [`Self::validate_cluster_port`].
    pub fn control_port(&self) -> u16 {
        self.port.saturating_add(CONTROL_PORT_OFFSET)
    }

    /// Reject configurations whose control port would not fit in a `u16`.
    pub fn validate_cluster_port(&self) -> Result<(), String> {
        if self.port > MAX_CLUSTER_PORT {
            return Err(format!(
                "frontend port {} leaves no room for the control port (port + {}); \
                 the maximum is {}",
                self.port, CONTROL_PORT_OFFSET, MAX_CLUSTER_PORT
            ));
        }
        Ok(())
    }
}

/// Initialise structured tracing for a binary (JSON in production, pretty
/// in dev).  `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &GatewayConfig) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.parse().unwrap_or_default()),
        )
        .with_target(true);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
