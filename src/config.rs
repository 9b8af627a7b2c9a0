//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub geolocation: GeolocationConfig,
    #[serde(default)]
    pub interceptor: InterceptorConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeolocationConfig {
    /// Lookup URL template; `{ip}` and `{key}` are substituted per request
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Upper bound on a single outbound lookup
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// Cache lifetime for lookup results, successful or failed
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
}

fn default_lookup_timeout_ms() -> u64 {
    3000
}

fn default_cache_ttl_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterceptorConfig {
    /// Proxy headers consulted for the client IP, highest priority first
    #[serde(default = "default_trusted_headers")]
    pub trusted_headers: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            trusted_headers: default_trusted_headers(),
        }
    }
}

fn default_trusted_headers() -> Vec<String> {
    vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Seconds between scan runs
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
    /// Trailing window each run analyzes
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    /// Request count above which an IP is flagged (strictly greater)
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: i64,
    #[serde(default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
            window_secs: default_window_secs(),
            volume_threshold: default_volume_threshold(),
            sensitive_paths: default_sensitive_paths(),
        }
    }
}

fn default_scan_interval_secs() -> u64 {
    3600
}

fn default_window_secs() -> i64 {
    3600
}

fn default_volume_threshold() -> i64 {
    100
}

fn default_sensitive_paths() -> Vec<String> {
    vec!["/admin".to_string(), "/login".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_ratelimit_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_ratelimit_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_ratelimit_window_secs(),
            max_requests: default_ratelimit_max_requests(),
        }
    }
}

fn default_ratelimit_window_secs() -> u64 {
    60
}

fn default_ratelimit_max_requests() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(config::Environment::with_prefix("GATEWATCH"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        // Validate database config
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        // Validate geolocation config
        if !self.geolocation.endpoint.contains("{ip}") {
            anyhow::bail!("Geolocation endpoint must contain an {{ip}} placeholder");
        }
        if self.geolocation.lookup_timeout_ms == 0 {
            anyhow::bail!("Geolocation lookup timeout cannot be 0");
        }
        if self.geolocation.cache_ttl_hours <= 0 {
            anyhow::bail!("Invalid geolocation cache TTL: {} hours", self.geolocation.cache_ttl_hours);
        }

        // Validate scanner config
        if self.scanner.interval_secs == 0 {
            anyhow::bail!("Scanner interval cannot be 0");
        }
        if self.scanner.window_secs <= 0 {
            anyhow::bail!("Invalid scanner window: {} seconds", self.scanner.window_secs);
        }
        if self.scanner.volume_threshold < 0 {
            anyhow::bail!("Invalid scanner volume threshold: {}", self.scanner.volume_threshold);
        }

        // Validate rate limit config
        if self.ratelimit.window_secs == 0 || self.ratelimit.max_requests == 0 {
            anyhow::bail!("Rate limit window and max_requests must be non-zero");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }
}
