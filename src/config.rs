use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

/// Upper bound on `SESSION_TTL_SECS`: ten years.
pub const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub users_file: PathBuf,
    pub public_dir: Option<PathBuf>,
    pub session_ttl_secs: u64,
    pub session_sweep_secs: u64,
    pub default_admin_password: String,
    pub cookie_secure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            users_file: PathBuf::from("./users.json"),
            public_dir: None,
            session_ttl_secs: 24 * 60 * 60,
            session_sweep_secs: 5 * 60,
            default_admin_password: DEFAULT_ADMIN_PASSWORD.to_string(),
            cookie_secure: false,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if present.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_admin_password = match lookup("DEFAULT_ADMIN_PASSWORD") {
            Some(password) if !password.is_empty() => password,
            _ => {
                warn!("DEFAULT_ADMIN_PASSWORD not set, seeding with the built-in default");
                defaults.default_admin_password
            }
        };

        let session_ttl_secs = parse(&lookup, "SESSION_TTL_SECS", defaults.session_ttl_secs)?;
        let session_sweep_secs =
            parse(&lookup, "SESSION_SWEEP_SECS", defaults.session_sweep_secs)?;

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            users_file: lookup("USERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.users_file),
            public_dir: lookup("PUBLIC_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            session_ttl_secs: at_most(
                positive(session_ttl_secs, "SESSION_TTL_SECS")?,
                MAX_SESSION_TTL_SECS,
                "SESSION_TTL_SECS",
            )?,
            session_sweep_secs: positive(session_sweep_secs, "SESSION_SWEEP_SECS")?,
            default_admin_password,
            cookie_secure: parse(&lookup, "COOKIE_SECURE", defaults.cookie_secure)?,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn positive(value: u64, key: &'static str) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn at_most(value: u64, max: u64, key: &'static str) -> Result<u64, ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid {
            key,
            message: format!("must be at most {max}"),
        });
    }
    Ok(value)
}
