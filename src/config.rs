// src/config.rs - Configuration management
use serde::Deserialize;
use std::env;
use anyhow::{Context, Result};
use rand::{thread_rng, Rng, distributions::Alphanumeric};
use std::path::Path;
use std::fs;
use url::Url;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
    pub prediction: PredictionConfig,
    pub geocoding: GeocodingConfig,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiration_hours: i64,
    pub bcrypt_cost: u32,
    pub max_login_attempts: u32,
    pub lockout_duration_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub max_request_size: usize,
    pub require_https: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// External crop-prediction service.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PredictionConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub fallback_enabled: bool,
}

/// Public reverse-geocoding API used for location autofill.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeocodingConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WebConfig {
    /// Directory with the built front-end (index.html + assets). Pages are
    /// not served when unset.
    pub dir: Option<String>,
}

// Defaults for tests (no ENV read here)
impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dummy_secret_for_tests_32_chars!!".to_string(),
            token_expiration_hours: 24,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            max_login_attempts: 5,
            lockout_duration_minutes: 15,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:agrisense.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:8080".to_string(),
            ],
            max_request_size: 12 * 1024 * 1024,
            require_https: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001".to_string(),
            timeout_seconds: 10,
            fallback_enabled: false,
        }
    }
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            timeout_seconds: 10,
            user_agent: concat!("agrisense/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
            prediction: PredictionConfig::default(),
            geocoding: GeocodingConfig::default(),
            web: WebConfig::default(),
        }
    }
}

pub fn generate_jwt_secret() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

pub fn load_config() -> Result<Config> {
    load_env_file()?;

    let mut config = if let Ok(config_file) = env::var("CONFIG_FILE") {
        let path = Path::new(&config_file);
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", config_file))?;
        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_file))?
    } else {
        Config::default()
    };

    override_with_env(&mut config);

    config.validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn override_with_env(config: &mut Config) {
    if let Ok(host) = env::var("BIND_ADDRESS") {
        config.server.host = host;
    }
    if let Some(port) = env_parse::<u16>("AGRISENSE_PORT") {
        config.server.port = port;
    }
    if let Some(workers) = env_parse::<usize>("AGRISENSE_WORKERS") {
        config.server.workers = Some(workers);
    }
    if let Ok(jwt_secret) = env::var("JWT_SECRET") {
        config.auth.jwt_secret = jwt_secret;
    }
    if let Some(expiration) = env_parse::<i64>("AUTH_TOKEN_EXPIRATION_HOURS") {
        config.auth.token_expiration_hours = expiration;
    }
    if let Some(cost) = env_parse::<u32>("AUTH_BCRYPT_COST") {
        config.auth.bcrypt_cost = cost;
    }
    if let Some(max) = env_parse::<u32>("AUTH_MAX_LOGIN_ATTEMPTS") {
        config.auth.max_login_attempts = max;
    }
    if let Some(lockout) = env_parse::<i64>("AUTH_LOCKOUT_DURATION_MINUTES") {
        config.auth.lockout_duration_minutes = lockout;
    }
    if let Ok(url) = env::var("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(max_conn) = env_parse::<u32>("DATABASE_MAX_CONNECTIONS") {
        config.database.max_connections = max_conn;
    }
    if let Ok(origins_str) = env::var("ALLOWED_ORIGINS") {
        config.security.allowed_origins = origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(url) = env::var("PREDICTION_SERVICE_URL") {
        config.prediction.base_url = url;
    }
    if let Some(timeout) = env_parse::<u64>("PREDICTION_TIMEOUT_SECONDS") {
        config.prediction.timeout_seconds = timeout;
    }
    if let Some(enabled) = env_parse::<bool>("PREDICTION_FALLBACK_ENABLED") {
        config.prediction.fallback_enabled = enabled;
    }
    if let Ok(url) = env::var("GEOCODING_URL") {
        config.geocoding.base_url = url;
    }
    if let Ok(dir) = env::var("WEB_DIR") {
        config.web.dir = Some(dir).filter(|d| !d.trim().is_empty());
    }
    if let Ok(level) = env::var("RUST_LOG") {
        config.logging.level = level;
    }
}

fn validate_service_url(name: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .with_context(|| format!("{} is not a valid URL: {}", name, value))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("{} must use http or https (got '{}')", name, url.scheme());
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 characters long (current: {})",
                self.auth.jwt_secret.len()
            ));
        }

        if self.auth.token_expiration_hours <= 0 {
            anyhow::bail!("token_expiration_hours must be positive");
        }

        if self.prediction.timeout_seconds == 0 || self.geocoding.timeout_seconds == 0 {
            anyhow::bail!("Outbound request timeouts must be greater than zero");
        }

        validate_service_url("prediction.base_url", &self.prediction.base_url)?;
        validate_service_url("geocoding.base_url", &self.geocoding.base_url)?;

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        env::var("AGRISENSE_ENV").map(|v| v == "production").unwrap_or(false)
    }

    pub fn print_startup_info(&self) {
        log::info!("AgriSense starting up");
        log::info!("Server: {}:{}", self.server.host, self.server.port);
        log::info!("Database: {}", self.database.url);
        log::info!("Auth: JWT ({}h expiration)", self.auth.token_expiration_hours);
        log::info!(
            "Prediction service: {} (timeout {}s, fallback {})",
            self.prediction.base_url,
            self.prediction.timeout_seconds,
            if self.prediction.fallback_enabled { "on" } else { "off" }
        );
        log::info!("Logging: {} level", self.logging.level);

        if !self.is_production() {
            log::warn!("Running in development mode");
        }
        if !self.security.require_https && self.is_production() {
            log::warn!("HTTPS not required in production mode");
        }
    }
}

pub fn load_env_file() -> Result<()> {
    if let Ok(env_file) = env::var("ENV_FILE") {
        dotenvy::from_filename(&env_file)
            .with_context(|| format!("Failed to load environment file: {}", env_file))?;
    } else if Path::new(".env").exists() {
        dotenvy::dotenv().context("Failed to load .env file")?;
    }
    Ok(())
}
