//! Application configuration

use std::env;
use std::time::Duration;

use crate::realtime::RealtimeSettings;
use crate::websocket::heartbeat::Heartbeat;

/// Key material used to verify bearer tokens
#[derive(Debug, Clone)]
pub enum AuthKey {
    /// HS256 shared secret
    Secret(String),
    /// RS256 public key in PEM format
    RsaPublicKeyPem(String),
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Shared presence store
    pub redis_url: String,
    pub service_name: String,
    pub presence_expiry_secs: u64,

    // Connection gateway
    pub allowed_hosts: Vec<String>,
    pub ws_ping_interval_ms: u64,
    pub ws_pong_timeout_ms: u64,

    // Authentication
    pub auth_issuer: String,
    pub auth_audience: String,
    pub auth_key: AuthKey,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Shared presence store
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            service_name: env::var("SERVICE_NAME")
                .ok()
                .filter(|name| !name.trim().is_empty())
                .ok_or(ConfigError::Missing("SERVICE_NAME"))?,
            presence_expiry_secs: parse_positive("PRESENCE_EXPIRY_SECS", 3600)?,

            // Connection gateway
            allowed_hosts: {
                let hosts: Vec<String> = env::var("ALLOWED_HOSTS")
                    .map_err(|_| ConfigError::Missing("ALLOWED_HOSTS"))?
                    .split(',')
                    .map(|host| host.trim().to_string())
                    .filter(|host| !host.is_empty())
                    .collect();
                if hosts.is_empty() {
                    return Err(ConfigError::Invalid(
                        "ALLOWED_HOSTS must list at least one origin",
                    ));
                }
                hosts
            },
            ws_ping_interval_ms: parse_positive("WS_PING_INTERVAL_MS", 2000)?,
            ws_pong_timeout_ms: parse_positive("WS_PONG_TIMEOUT_MS", 10000)?,

            // Authentication
            auth_issuer: env::var("AUTH_ISSUER").map_err(|_| ConfigError::Missing("AUTH_ISSUER"))?,
            auth_audience: env::var("AUTH_AUDIENCE")
                .map_err(|_| ConfigError::Missing("AUTH_AUDIENCE"))?,
            auth_key: match (env::var("AUTH_PUBLIC_KEY_PEM").ok(), env::var("JWT_SECRET").ok()) {
                (Some(pem), _) if !pem.trim().is_empty() => AuthKey::RsaPublicKeyPem(pem),
                (_, Some(secret)) => {
                    if secret.len() < 32 {
                        return Err(ConfigError::WeakSecret(
                            "JWT_SECRET must be at least 32 characters",
                        ));
                    }
                    AuthKey::Secret(secret)
                }
                _ => return Err(ConfigError::Missing("AUTH_PUBLIC_KEY_PEM or JWT_SECRET")),
            },
        })
    }

    /// Settings consumed by the realtime service
    pub fn realtime(&self) -> RealtimeSettings {
        RealtimeSettings {
            service_name: self.service_name.clone(),
            presence_ttl: Duration::from_secs(self.presence_expiry_secs),
            heartbeat: Heartbeat::new(
                Duration::from_millis(self.ws_ping_interval_ms),
                Duration::from_millis(self.ws_pong_timeout_ms),
            ),
        }
    }
}

fn parse_positive(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::InvalidNumber(name)),
        },
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Environment variable {0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "SERVICE_NAME",
        "ALLOWED_HOSTS",
        "AUTH_ISSUER",
        "AUTH_AUDIENCE",
        "JWT_SECRET",
        "AUTH_PUBLIC_KEY_PEM",
        "WS_PING_INTERVAL_MS",
        "WS_PONG_TIMEOUT_MS",
        "PRESENCE_EXPIRY_SECS",
    ];

    /// Helper to set required env vars for testing
    fn setup_minimal_config() {
        cleanup_config();
        env::set_var("SERVICE_NAME", "drn");
        env::set_var("ALLOWED_HOSTS", "https://app.example.com, http://localhost:5173");
        env::set_var("AUTH_ISSUER", "https://auth.example.com");
        env::set_var("AUTH_AUDIENCE", "drn-api");
        env::set_var("JWT_SECRET", "test-jwt-secret-must-be-at-least-32-characters-long");
    }

    /// Helper to clear env vars after tests
    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.ws_ping_interval_ms, 2000);
        assert_eq!(config.ws_pong_timeout_ms, 10000);
        assert_eq!(
            config.allowed_hosts,
            vec!["https://app.example.com", "http://localhost:5173"]
        );
        assert!(matches!(config.auth_key, AuthKey::Secret(_)));

        let settings = config.realtime();
        assert_eq!(settings.service_name, "drn");
        assert_eq!(settings.presence_ttl, Duration::from_secs(3600));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_service_name() {
        setup_minimal_config();
        env::remove_var("SERVICE_NAME");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("SERVICE_NAME"))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_empty_allowed_hosts_rejected() {
        setup_minimal_config();
        env::set_var("ALLOWED_HOSTS", " , ");

        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_weak_secret_rejected() {
        setup_minimal_config();
        env::set_var("JWT_SECRET", "short");

        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_public_key_preferred_over_secret() {
        setup_minimal_config();
        env::set_var("AUTH_PUBLIC_KEY_PEM", "-----BEGIN PUBLIC KEY-----");

        let config = Config::from_env().unwrap();
        assert!(matches!(config.auth_key, AuthKey::RsaPublicKeyPem(_)));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_heartbeat_values() {
        setup_minimal_config();
        env::set_var("WS_PONG_TIMEOUT_MS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidNumber("WS_PONG_TIMEOUT_MS"))
        ));

        env::set_var("WS_PONG_TIMEOUT_MS", "soon");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidNumber("WS_PONG_TIMEOUT_MS"))
        ));

        cleanup_config();
    }
}
