//! Server configuration module.
//!
//! Parses configuration from environment variables for the Merathon server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ACCESS_TOKEN_SECRET` | Yes | - | HMAC secret used to sign session tokens |
//! | `MONGODB_URI` | No | - | Full connection string, overrides `DB_USER`/`DB_PASS`/`DB_HOST` |
//! | `DB_USER` | Yes* | - | Database user |
//! | `DB_PASS` | Yes* | - | Database password |
//! | `DB_HOST` | Yes* | - | Cluster host (e.g. `cluster0.xxxx.mongodb.net`) |
//! | `DB_NAME` | No | merathonDB | Database name |
//! | `OPENAI_API_KEY` | No | - | Completion service key (chat relay disabled if unset) |
//! | `OPENAI_BASE_URL` | No | https://api.openai.com | Completion service base URL |
//! | `PORT` | No | 5000 | HTTP server port |
//! | `APP_ENV` | No | development | `production` enables cross-site secure cookies |
//! | `CORS_ORIGINS` | No | http://localhost:5173 | Comma-separated allowed origins |
//! | `MERATHON_IN_MEMORY_STORE` | No | false | Use the in-process store (dev only) |
//!
//! *Not required if `MONGODB_URI` is set or `MERATHON_IN_MEMORY_STORE=true`

use std::env;
use std::fmt;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 5000;

/// Default database name.
const DEFAULT_DB_NAME: &str = "merathonDB";

/// Default completion service base URL.
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Origin allowed when `CORS_ORIGINS` is not set.
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Where and how to reach the database.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Connection string, including credentials.
    pub uri: String,

    /// Database holding the `event` and `registration` collections.
    pub name: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("uri", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Database settings. `None` only when `in_memory_store` is set.
    pub database: Option<DatabaseConfig>,

    /// When true, events and registrations live in process memory.
    pub in_memory_store: bool,

    /// Secret for signing and verifying session tokens.
    pub token_secret: String,

    /// Completion service API key.
    pub openai_api_key: Option<String>,

    /// Completion service base URL.
    pub openai_base_url: String,

    /// Production deployments get `Secure; SameSite=None` session cookies.
    pub production: bool,

    /// Origins allowed to make credentialed cross-origin requests.
    pub allowed_origins: Vec<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database", &self.database)
            .field("in_memory_store", &self.in_memory_store)
            .field("token_secret", &"<redacted>")
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("openai_base_url", &self.openai_base_url)
            .field("production", &self.production)
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `ACCESS_TOKEN_SECRET` is missing or empty
    /// - Database variables are missing (unless `MONGODB_URI` or the in-memory store is used)
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use merathon_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let in_memory_store = parse_bool_env("MERATHON_IN_MEMORY_STORE");
        let port = parse_port()?;
        let token_secret = required_env("ACCESS_TOKEN_SECRET")?;
        let database = if in_memory_store {
            None
        } else {
            Some(parse_database()?)
        };
        let openai_api_key = optional_env("OPENAI_API_KEY");
        let openai_base_url = optional_env("OPENAI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
        let production = env::var("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let allowed_origins = parse_origins()?;

        let config = Self {
            port,
            database,
            in_memory_store,
            token_secret,
            openai_api_key,
            openai_base_url,
            production,
            allowed_origins,
        };

        if config.in_memory_store {
            warn!(
                "MERATHON_IN_MEMORY_STORE is enabled - data is not persisted. \
                 Do not use in production!"
            );
        }

        if config.openai_api_key.is_none() {
            warn!("OPENAI_API_KEY is not set - the chat relay will reject requests");
        }

        Ok(config)
    }
}

/// Read an environment variable, treating empty values as unset.
fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Build the database settings.
///
/// `MONGODB_URI` wins when present; otherwise the SRV connection string is
/// assembled from `DB_USER`, `DB_PASS` and `DB_HOST`. User and password are
/// percent-encoded, so they may contain `@`, `:` or `/`.
fn parse_database() -> Result<DatabaseConfig, ConfigError> {
    let name = optional_env("DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string());

    if let Some(uri) = optional_env("MONGODB_URI") {
        return Ok(DatabaseConfig { uri, name });
    }

    let user = required_env("DB_USER")?;
    let password = required_env("DB_PASS")?;
    let host = required_env("DB_HOST")?;

    if host.contains('/') || host.contains('@') {
        return Err(ConfigError::InvalidFormat {
            var: "DB_HOST".to_string(),
            message: format!("expected a bare host name, got '{host}'"),
        });
    }

    let uri = format!(
        "mongodb+srv://{}:{}@{host}/?retryWrites=true&w=majority",
        encode_credential(&user),
        encode_credential(&password)
    );

    Ok(DatabaseConfig { uri, name })
}

/// Percent-encodes every byte outside the RFC 3986 unreserved set.
fn encode_credential(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(char::from(byte));
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Parse the CORS_ORIGINS environment variable.
///
/// Expected format: `https://a.example,https://b.example`
fn parse_origins() -> Result<Vec<String>, ConfigError> {
    let origins_str = match optional_env("CORS_ORIGINS") {
        Some(s) => s,
        None => return Ok(vec![DEFAULT_CORS_ORIGIN.to_string()]),
    };

    let mut origins = Vec::new();

    for origin in origins_str.split(',') {
        let origin = origin.trim().trim_end_matches('/');
        if origin.is_empty() {
            continue;
        }

        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(ConfigError::InvalidFormat {
                var: "CORS_ORIGINS".to_string(),
                message: format!("origin '{origin}' must start with http:// or https://"),
            });
        }

        origins.push(origin.to_string());
    }

    Ok(origins)
}
