use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::route::Route;
use crate::upstream::RetryPolicy;

/// Environment variable that overrides `upstream.base_url`.
pub const BASE_URL_ENV: &str = "API_BASE_URL";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-route retry tweaks layered on top of [`RetryConfig`].
    #[serde(
        default = "default_route_overrides",
        deserialize_with = "route_overrides_over_defaults"
    )]
    pub route_overrides: HashMap<Route, RetryOverride>,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            route_overrides: default_route_overrides(),
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the effective retry policy for `route`.
    pub fn retry_policy(&self, route: Route) -> RetryPolicy {
        let base = &self.retry;
        let over = self.route_overrides.get(&route);

        let max_attempts = over
            .and_then(|o| o.max_attempts)
            .unwrap_or(base.max_attempts);
        let base_delay_ms = over
            .and_then(|o| o.base_delay_ms)
            .unwrap_or(base.base_delay_ms);
        let timeout_secs = over
            .and_then(|o| o.timeout_secs)
            .unwrap_or(base.timeout_secs);
        let retry_statuses = over
            .and_then(|o| o.retry_statuses.clone())
            .unwrap_or_else(|| base.retry_statuses.clone());

        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(timeout_secs),
            Duration::from_millis(base_delay_ms),
            retry_statuses,
        )
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Root URL of the upstream service (e.g. `https://api.example.com`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path prefix under which the REST resources live.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    /// `base_url` + `api_prefix`, without a trailing slash.
    pub fn api_root(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_prefix.trim_matches('/'),
        )
        .trim_end_matches('/')
        .to_string()
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_user_agent() -> String {
    concat!("wellbeing-proxy/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per outbound call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles on each subsequent retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Deadline applied to each individual attempt.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upstream statuses that trigger a retry.
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503]
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub retry_statuses: Option<Vec<u16>>,
}

impl RetryOverride {
    /// Fields set in `other` win; unset fields keep their current value.
    fn layer(&mut self, other: RetryOverride) {
        self.max_attempts = other.max_attempts.or(self.max_attempts);
        self.base_delay_ms = other.base_delay_ms.or(self.base_delay_ms);
        self.timeout_secs = other.timeout_secs.or(self.timeout_secs);
        self.retry_statuses = other.retry_statuses.or(self.retry_statuses.take());
    }
}

/// User overrides are layered onto the built-in table field by field, so a
/// route missing from the file keeps its built-in entry.
fn route_overrides_over_defaults<'de, D>(
    deserializer: D,
) -> Result<HashMap<Route, RetryOverride>, D::Error>
where
    D: Deserializer<'de>,
{
    let user = HashMap::<Route, RetryOverride>::deserialize(deserializer)?;
    let mut merged = default_route_overrides();
    for (route, over) in user {
        merged.entry(route).or_default().layer(over);
    }
    Ok(merged)
}

fn default_route_overrides() -> HashMap<Route, RetryOverride> {
    let short_timeout = RetryOverride {
        timeout_secs: Some(10),
        ..RetryOverride::default()
    };
    HashMap::from([
        (
            Route::WellbeingRanking,
            RetryOverride {
                max_attempts: Some(4),
                retry_statuses: Some((500..=599).collect()),
                ..RetryOverride::default()
            },
        ),
        (Route::Congestion, short_timeout.clone()),
        (Route::LiveCongestion, short_timeout),
    ])
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Timeout for each individual upstream probe.
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_health_timeout(),
        }
    }
}

fn default_health_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from the YAML file at `path` (or built-in defaults when
/// no path is given), apply the environment override and validate it.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            parse_config(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    apply_base_url_override(&mut config, std::env::var(BASE_URL_ENV).ok());
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    // An empty file is a valid "all defaults" config.
    if contents.trim().is_empty() {
        return Ok(serde_yaml::from_str("{}")?);
    }
    Ok(serde_yaml::from_str(contents)?)
}

fn apply_base_url_override(config: &mut Config, value: Option<String>) {
    if let Some(url) = value.filter(|v| !v.trim().is_empty()) {
        config.upstream.base_url = url.trim().to_string();
    }
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let url = reqwest::Url::parse(&config.upstream.base_url)
        .with_context(|| format!("invalid upstream.base_url: {}", config.upstream.base_url))?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "upstream.base_url must use http or https"
    );
    anyhow::ensure!(
        config.server.listen.parse::<std::net::SocketAddr>().is_ok(),
        "server.listen must be a socket address"
    );
    anyhow::ensure!(config.health.timeout_secs > 0, "health.timeout_secs must be > 0");

    check_retry(
        "retry",
        Some(config.retry.max_attempts),
        Some(config.retry.timeout_secs),
        Some(&config.retry.retry_statuses),
    )?;
    for (route, over) in &config.route_overrides {
        check_retry(
            &format!("route_overrides.{route}"),
            over.max_attempts,
            over.timeout_secs,
            over.retry_statuses.as_ref(),
        )?;
    }
    Ok(())
}

fn check_retry(
    section: &str,
    max_attempts: Option<u32>,
    timeout_secs: Option<u64>,
    retry_statuses: Option<&Vec<u16>>,
) -> Result<()> {
    if let Some(n) = max_attempts {
        anyhow::ensure!(n >= 1, "{section}.max_attempts must be >= 1");
    }
    if let Some(t) = timeout_secs {
        anyhow::ensure!(t > 0, "{section}.timeout_secs must be > 0");
    }
    if let Some(statuses) = retry_statuses {
        anyhow::ensure!(
            statuses.iter().all(|s| (500..=599).contains(s)),
            "{section}.retry_statuses must be 5xx codes"
        );
    }
    Ok(())
}
