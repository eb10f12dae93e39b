use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_local_path")]
    pub local_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Per-user quota in megabytes, shared by every principal
    #[serde(default = "default_user_quota_mb")]
    pub user_quota_mb: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity and refill amount per interval
    #[serde(default = "default_requests_per_interval")]
    pub requests_per_interval: i64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Idle window after which a principal's bucket is evicted; also the sweep period
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_db_path() -> String {
    "data/filevault.db".to_string()
}

fn default_local_path() -> String {
    "data/uploads".to_string()
}

fn default_user_quota_mb() -> i64 {
    10
}

fn default_requests_per_interval() -> i64 {
    10
}

fn default_interval_secs() -> u64 {
    1
}

fn default_idle_eviction_secs() -> u64 {
    300 // 5 minutes
}

fn default_jwt_secret() -> String {
    "supersecret".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_path: default_local_path(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            user_quota_mb: default_user_quota_mb(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: default_requests_per_interval(),
            interval_secs: default_interval_secs(),
            idle_eviction_secs: default_idle_eviction_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl QuotaConfig {
    /// Quota in bytes; negative values fall back to the default
    pub fn quota_bytes(&self) -> i64 {
        let mb = if self.user_quota_mb < 0 {
            default_user_quota_mb()
        } else {
            self.user_quota_mb
        };
        mb.saturating_mul(1024 * 1024)
    }
}

impl RateLimitConfig {
    pub fn capacity(&self) -> u32 {
        if self.requests_per_interval < 0 {
            return 2;
        }
        self.requests_per_interval.clamp(1, u32::MAX as i64) as u32
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs.max(1))
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        if config.auth.jwt_secret == default_jwt_secret() {
            tracing::warn!("Using the default JWT secret, set FV_CONF_AUTH_JWT_SECRET");
        }
        tracing::info!(
            "Quota {} bytes per user, rate limit {} requests per {:?}",
            config.quota.quota_bytes(),
            config.rate_limit.capacity(),
            config.rate_limit.interval()
        );
        Ok(config)
    }

    /// Load configuration from config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: FV_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("FV_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("FV_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var("FV_CONF_SERVER_MAX_UPLOAD_BYTES") {
            if let Ok(bytes) = val.parse() {
                self.server.max_upload_bytes = bytes;
            }
        }

        // Database overrides
        if let Ok(val) = env::var("FV_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // Storage overrides
        if let Ok(val) = env::var("FV_CONF_STORAGE_LOCAL_PATH") {
            self.storage.local_path = val;
        }

        // Quota overrides
        if let Ok(val) = env::var("FV_CONF_QUOTA_USER_QUOTA_MB") {
            if let Ok(mb) = val.parse() {
                self.quota.user_quota_mb = mb;
            }
        }

        // Rate limit overrides
        if let Ok(val) = env::var("FV_CONF_RATE_LIMIT_REQUESTS_PER_INTERVAL") {
            if let Ok(n) = val.parse() {
                self.rate_limit.requests_per_interval = n;
            }
        }
        if let Ok(val) = env::var("FV_CONF_RATE_LIMIT_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.rate_limit.interval_secs = secs;
            }
        }
        if let Ok(val) = env::var("FV_CONF_RATE_LIMIT_IDLE_EVICTION_SECS") {
            if let Ok(secs) = val.parse() {
                self.rate_limit.idle_eviction_secs = secs;
            }
        }

        // Auth overrides
        if let Ok(val) = env::var("FV_CONF_AUTH_JWT_SECRET") {
            if !val.trim().is_empty() {
                self.auth.jwt_secret = val;
            }
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        fs::create_dir_all(&self.storage.local_path)?;

        Ok(())
    }
}
