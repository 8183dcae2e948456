use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => anyhow::bail!("Unknown APP_ENV: {}", other),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Total lifetime of a session.
    pub session_timeout: Duration,
    /// Idle time after which a session is rejected.
    pub inactivity_timeout: Duration,
    /// Maximum concurrent sessions per user before eviction.
    pub max_sessions_per_user: usize,
    /// Percentage of the lifetime after which extension is advised.
    pub extension_threshold_percent: u8,
    /// Hard-invalidate on IP or user-agent mismatch instead of logging.
    pub enable_suspicious_activity_detection: bool,
    /// TTL renewed on every device record write.
    pub device_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(24 * 3600),
            inactivity_timeout: Duration::from_secs(30 * 60),
            max_sessions_per_user: 5,
            extension_threshold_percent: 75,
            enable_suspicious_activity_detection: true,
            device_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Origin validation settings.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub whitelist: HashSet<String>,
    pub blacklist: HashSet<String>,
    pub base_domains: Vec<String>,
    pub subdomain_matching: bool,
    pub strict_mode: bool,
    pub allow_loopback: bool,
    pub allow_credentials: bool,
    /// Unknown origins that pass every check are allowed (development only).
    pub permissive: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
            base_domains: Vec::new(),
            subdomain_matching: false,
            strict_mode: false,
            allow_loopback: true,
            allow_credentials: true,
            permissive: true,
        }
    }
}

/// Feature flags and limits for the request firewall.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub enable_ip_checks: bool,
    pub enable_user_agent_checks: bool,
    pub enable_rate_limit: bool,
    pub enable_sanitization: bool,
    pub enable_pattern_detection: bool,
    pub enable_csrf: bool,
    pub enable_fingerprinting: bool,
    pub max_body_bytes: usize,
    pub blocked_ips: HashSet<String>,
    pub suspicious_ips: HashSet<String>,
    pub risk_log_threshold: u32,
    /// Attach risk debug headers to responses.
    pub debug_headers: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enable_ip_checks: true,
            enable_user_agent_checks: true,
            enable_rate_limit: true,
            enable_sanitization: true,
            enable_pattern_detection: true,
            enable_csrf: true,
            enable_fingerprinting: true,
            max_body_bytes: 10 * 1024 * 1024,
            blocked_ips: HashSet::new(),
            suspicious_ips: HashSet::new(),
            risk_log_threshold: 50,
            debug_headers: true,
        }
    }
}

/// Default budget for the adaptive rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    pub environment: Environment,
    /// The address the server binds to.
    pub bind_addr: SocketAddr,
    /// The URL of the Redis server.
    pub redis_url: String,
    /// Latency budget for every shared-store call.
    pub store_timeout: Duration,
    /// The master key used for encryption.
    pub master_key: Zeroizing<Vec<u8>>,
    pub session: SessionConfig,
    pub cors: CorsConfig,
    pub firewall: FirewallConfig,
    pub rate_limit: RateLimitConfig,
    /// Optional operator account seeded at startup.
    pub bootstrap_admin: Option<(String, Zeroizing<String>)>,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut master_key_hex = env::var("MASTER_KEY")
            .context("MASTER_KEY must be set (generate with: openssl rand -hex 32)")?;

        let master_key_bytes = hex::decode(&master_key_hex)
            .context("MASTER_KEY must be valid hexadecimal")?;

        master_key_hex.zeroize();

        if master_key_bytes.len() != 32 {
            anyhow::bail!("MASTER_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let environment: Environment = env_or("APP_ENV", Environment::Development)?;
        let production = environment.is_production();

        let session = SessionConfig {
            session_timeout: Duration::from_secs(env_or("SESSION_TIMEOUT_SECS", 86_400u64)?),
            inactivity_timeout: Duration::from_secs(env_or(
                "SESSION_INACTIVITY_TIMEOUT_SECS",
                1_800u64,
            )?),
            max_sessions_per_user: env_or("SESSION_MAX_PER_USER", 5usize)?,
            extension_threshold_percent: env_or("SESSION_EXTENSION_THRESHOLD", 75u8)?,
            enable_suspicious_activity_detection: env_or(
                "SESSION_SUSPICIOUS_ACTIVITY_DETECTION",
                true,
            )?,
            device_ttl: Duration::from_secs(env_or("SESSION_DEVICE_TTL_SECS", 2_592_000u64)?),
        };

        if session.max_sessions_per_user == 0 {
            anyhow::bail!("SESSION_MAX_PER_USER must be at least 1");
        }
        if session.extension_threshold_percent > 100 {
            anyhow::bail!("SESSION_EXTENSION_THRESHOLD is a percentage (0-100)");
        }

        let cors = CorsConfig {
            whitelist: env_set("CORS_WHITELIST"),
            blacklist: env_set("CORS_BLACKLIST"),
            base_domains: env_list("CORS_BASE_DOMAINS"),
            subdomain_matching: env_or("CORS_SUBDOMAIN_MATCHING", false)?,
            strict_mode: env_or("CORS_STRICT_MODE", production)?,
            allow_loopback: env_or("CORS_ALLOW_LOOPBACK", !production)?,
            allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true)?,
            permissive: !production,
        };

        let firewall = FirewallConfig {
            enable_ip_checks: env_or("FIREWALL_ENABLE_IP_CHECKS", true)?,
            enable_user_agent_checks: env_or("FIREWALL_ENABLE_USER_AGENT_CHECKS", true)?,
            enable_rate_limit: env_or("FIREWALL_ENABLE_RATE_LIMIT", true)?,
            enable_sanitization: env_or("FIREWALL_ENABLE_SANITIZATION", true)?,
            enable_pattern_detection: env_or("FIREWALL_ENABLE_PATTERN_DETECTION", true)?,
            enable_csrf: env_or("FIREWALL_ENABLE_CSRF", true)?,
            enable_fingerprinting: env_or("FIREWALL_ENABLE_FINGERPRINTING", true)?,
            max_body_bytes: env_or("FIREWALL_MAX_BODY_BYTES", 10_485_760usize)?,
            blocked_ips: env_set("FIREWALL_BLOCKED_IPS"),
            suspicious_ips: env_set("FIREWALL_SUSPICIOUS_IPS"),
            risk_log_threshold: env_or("FIREWALL_RISK_LOG_THRESHOLD", 50u32)?,
            debug_headers: !production,
        };

        let rate_limit = RateLimitConfig {
            max_requests: env_or("RATE_LIMIT_MAX_REQUESTS", 100u64)?,
            window: Duration::from_secs(env_or("RATE_LIMIT_WINDOW_SECS", 60u64)?),
        };

        let bootstrap_admin = match (
            env::var("BOOTSTRAP_ADMIN_USERNAME"),
            env::var("BOOTSTRAP_ADMIN_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Some((username, Zeroizing::new(password))),
            _ => None,
        };

        Ok(Self {
            environment,
            bind_addr: env_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            store_timeout: Duration::from_millis(env_or("STORE_TIMEOUT_MS", 2_000u64)?),
            master_key: Zeroizing::new(master_key_bytes),
            session,
            cors,
            firewall,
            rate_limit,
            bootstrap_admin,
        })
    }

    /// A configuration for tests and local tooling, keyed by the given master key.
    pub fn for_environment(environment: Environment, master_key: [u8; 32]) -> Self {
        let production = environment.is_production();
        Self {
            environment,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            store_timeout: Duration::from_secs(2),
            master_key: Zeroizing::new(master_key.to_vec()),
            session: SessionConfig::default(),
            cors: CorsConfig {
                strict_mode: production,
                allow_loopback: !production,
                permissive: !production,
                ..CorsConfig::default()
            },
            firewall: FirewallConfig {
                debug_headers: !production,
                ..FirewallConfig::default()
            },
            rate_limit: RateLimitConfig::default(),
            bootstrap_admin: None,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}

/// Parses an environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        _ => Ok(default),
    }
}

/// Reads a comma separated list, dropping empty entries.
fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_ascii_lowercase())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_set(name: &str) -> HashSet<String> {
    env_list(name)
        .into_iter()
        .map(|item| item.trim_end_matches('/').to_string())
        .collect()
}
