//! API server configuration.

use std::time::Duration;

use marquee_core::auth::jwt::{TokenTtls, resolve_signing_secret};
use thiserror::Error;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Secret(String),
}

/// Configuration for the API server.
#[derive(Clone)]
pub struct ApiConfig {
    pub environment: Environment,
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL, or `memory://` for the in-memory store.
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub ttls: TokenTtls,
    /// How long login waits for the database to come up.
    pub db_ready_timeout: Duration,
    pub sse_keep_alive: Duration,
    /// Reject protected calls when sessions cannot be checked.
    pub session_fail_closed: bool,
    /// Start the tenant's agent after a successful PIN login.
    pub agent_autostart: bool,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("environment", &self.environment)
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url)
            .field("ttls", &self.ttls)
            .field("db_ready_timeout", &self.db_ready_timeout)
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("session_fail_closed", &self.session_fail_closed)
            .field("agent_autostart", &self.agent_autostart)
            .finish_non_exhaustive()
    }
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                 | Default                                |
    /// |--------------------------|----------------------------------------|
    /// | `MARQUEE_ENV`            | `development`                          |
    /// | `BIND_ADDR`              | `127.0.0.1:3100`                       |
    /// | `DATABASE_URL`           | `postgres://localhost:5432/marquee`    |
    /// | `JWT_SECRET`             | development fallback                   |
    /// | `JWT_REFRESH_SECRET`     | derived from `JWT_SECRET`              |
    /// | `ACCESS_TOKEN_TTL_SECS`  | `86400`                                |
    /// | `REFRESH_TOKEN_TTL_SECS` | `604800`                               |
    /// | `PENDING_AUTH_TTL_SECS`  | `300`                                  |
    /// | `AGENT_GRANT_TTL_SECS`   | `900`                                  |
    /// | `DB_READY_TIMEOUT_SECS`  | `40`                                   |
    /// | `SSE_KEEP_ALIVE_SECS`    | `30`                                   |
    /// | `SESSION_FAIL_CLOSED`    | `false`                                |
    /// | `AGENT_AUTOSTART`        | `true`                                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ApiConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let environment = match lookup("MARQUEE_ENV")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("development") | Some("dev") => Environment::Development,
            Some("production") | Some("prod") => Environment::Production,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "MARQUEE_ENV",
                    value: other.to_string(),
                    reason: "expected development or production".into(),
                });
            }
        };
        let production = environment == Environment::Production;

        let jwt_secret = resolve_signing_secret("JWT_SECRET", lookup("JWT_SECRET").as_deref(), production)
            .map_err(|e| ConfigError::Secret(e.to_string()))?;
        let jwt_refresh_secret = match lookup("JWT_REFRESH_SECRET").filter(|v| !v.trim().is_empty()) {
            Some(value) => resolve_signing_secret("JWT_REFRESH_SECRET", Some(&value), production)
                .map_err(|e| ConfigError::Secret(e.to_string()))?,
            None => format!("{jwt_secret}:refresh"),
        };

        let ttls = TokenTtls {
            access: chrono::Duration::seconds(secs(&lookup, "ACCESS_TOKEN_TTL_SECS", 86_400)? as i64),
            refresh: chrono::Duration::seconds(secs(&lookup, "REFRESH_TOKEN_TTL_SECS", 604_800)? as i64),
            pending: chrono::Duration::seconds(secs(&lookup, "PENDING_AUTH_TTL_SECS", 300)? as i64),
            agent_grant: chrono::Duration::seconds(secs(&lookup, "AGENT_GRANT_TTL_SECS", 900)? as i64),
        };

        Ok(Self {
            environment,
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3100".into()),
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost:5432/marquee".into()),
            jwt_secret,
            jwt_refresh_secret,
            ttls,
            db_ready_timeout: Duration::from_secs(secs(&lookup, "DB_READY_TIMEOUT_SECS", 40)?),
            sse_keep_alive: Duration::from_secs(secs(&lookup, "SSE_KEEP_ALIVE_SECS", 30)?.max(1)),
            session_fail_closed: flag(&lookup, "SESSION_FAIL_CLOSED", false)?,
            agent_autostart: flag(&lookup, "AGENT_AUTOSTART", true)?,
        })
    }

    /// Development defaults with an in-memory store and fixed secrets.
    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            bind_addr: "127.0.0.1:0".into(),
            database_url: "memory://".into(),
            jwt_secret: "development-access-secret-0123456789abcdef".into(),
            jwt_refresh_secret: "development-refresh-secret-0123456789abcdef".into(),
            ttls: TokenTtls::default(),
            db_ready_timeout: Duration::from_secs(1),
            sse_keep_alive: Duration::from_secs(30),
            session_fail_closed: false,
            agent_autostart: true,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// True when `DATABASE_URL` selects the in-memory store.
    pub fn uses_memory_store(&self) -> bool {
        self.database_url.starts_with("memory:")
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: format!("{e}"),
        }),
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: "expected a boolean".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ApiConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ApiConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_in_development() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.bind_addr, "127.0.0.1:3100");
        assert_eq!(cfg.ttls.access, chrono::Duration::hours(24));
        assert_eq!(cfg.ttls.refresh, chrono::Duration::days(7));
        assert_eq!(cfg.db_ready_timeout, Duration::from_secs(40));
        assert_eq!(cfg.sse_keep_alive, Duration::from_secs(30));
        assert!(!cfg.session_fail_closed);
        assert!(cfg.agent_autostart);
        assert_ne!(cfg.jwt_secret, cfg.jwt_refresh_secret);
    }

    #[test]
    fn production_without_secret_is_fatal() {
        assert!(matches!(
            config(&[("MARQUEE_ENV", "production")]),
            Err(ConfigError::Secret(_))
        ));
        assert!(matches!(
            config(&[("MARQUEE_ENV", "production"), ("JWT_SECRET", "too-short")]),
            Err(ConfigError::Secret(_))
        ));
        let secret = "s".repeat(40);
        let cfg = config(&[("MARQUEE_ENV", "PRODUCTION"), ("JWT_SECRET", &secret)]).unwrap();
        assert!(cfg.is_production());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("ACCESS_TOKEN_TTL_SECS", "60"),
            ("SESSION_FAIL_CLOSED", "yes"),
            ("AGENT_AUTOSTART", "0"),
            ("DATABASE_URL", "memory://"),
        ])
        .unwrap();
        assert_eq!(cfg.ttls.access, chrono::Duration::seconds(60));
        assert!(cfg.session_fail_closed);
        assert!(!cfg.agent_autostart);
        assert!(cfg.uses_memory_store());
    }

    #[test]
    fn garbage_values_are_rejected() {
        assert!(matches!(
            config(&[("DB_READY_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::Invalid { name: "DB_READY_TIMEOUT_SECS", .. })
        ));
        assert!(config(&[("MARQUEE_ENV", "staging")]).is_err());
        assert!(config(&[("AGENT_AUTOSTART", "maybe")]).is_err());
    }
}
