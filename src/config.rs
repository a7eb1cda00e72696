//! Configuration for the Swift upload proxy

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Object storage backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// How the backend bearer token is obtained
    #[serde(default)]
    pub auth: AuthConfig,

    /// How many chunks ahead of the stream cursor may be buffered for a
    /// streamed (non-segmented) upload
    #[serde(default = "default_reorder_window")]
    pub reorder_window: u32,

    /// Idle time after which an unfinished upload session is dropped
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    /// Request body limit for one chunk request, in bytes
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Log level filter string.
    /// Set via config file or SUP_LOG_LEVEL env var. Overridden by RUST_LOG.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Object storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local directory, for development and tests
    Filesystem {
        /// Directory for data storage
        path: PathBuf,
    },

    /// OpenStack Swift object storage
    Swift {
        /// Account storage URL. `{project}` is replaced by the project from
        /// the request path, e.g. `https://object.example.org/v1/AUTH_{project}`
        storage_url: String,

        /// Per-request backend timeout in seconds
        #[serde(default = "default_backend_timeout_secs")]
        timeout_secs: u64,
    },
}

/// Backend token acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// No token (filesystem backend, or an open Swift for testing)
    None,

    /// Fixed, pre-issued token
    Static { token: String },

    /// Keystone v3 password authentication
    Keystone {
        auth_url: String,
        username: String,
        password: String,
        #[serde(default = "default_domain")]
        user_domain: String,
        project_name: String,
        #[serde(default = "default_domain")]
        project_domain: String,
    },
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8090))
}

fn default_reorder_window() -> u32 {
    1
}

fn default_session_idle_secs() -> u64 {
    60 * 60
}

fn default_max_chunk_size() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_backend_timeout_secs() -> u64 {
    60
}

fn default_domain() -> String {
    "Default".to_string()
}

fn default_log_level() -> String {
    "swift_upload_proxy=debug,tower_http=info".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            path: PathBuf::from("./data"),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backend: BackendConfig::default(),
            auth: AuthConfig::default(),
            reorder_window: default_reorder_window(),
            session_idle_secs: default_session_idle_secs(),
            max_chunk_size: default_max_chunk_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SUP_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(url) = std::env::var("SUP_SWIFT_STORAGE_URL") {
            config.backend = BackendConfig::Swift {
                storage_url: url,
                timeout_secs: env_parse("SUP_BACKEND_TIMEOUT_SECS")
                    .unwrap_or_else(default_backend_timeout_secs),
            };
        } else if let Ok(dir) = std::env::var("SUP_DATA_DIR") {
            config.backend = BackendConfig::Filesystem {
                path: PathBuf::from(dir),
            };
        }

        if let Ok(auth_url) = std::env::var("SUP_KEYSTONE_URL") {
            config.auth = AuthConfig::Keystone {
                auth_url,
                username: std::env::var("SUP_KEYSTONE_USERNAME").unwrap_or_default(),
                password: std::env::var("SUP_KEYSTONE_PASSWORD").unwrap_or_default(),
                user_domain: std::env::var("SUP_KEYSTONE_USER_DOMAIN")
                    .unwrap_or_else(|_| default_domain()),
                project_name: std::env::var("SUP_KEYSTONE_PROJECT").unwrap_or_default(),
                project_domain: std::env::var("SUP_KEYSTONE_PROJECT_DOMAIN")
                    .unwrap_or_else(|_| default_domain()),
            };
        } else if let Ok(token) = std::env::var("SUP_AUTH_TOKEN") {
            config.auth = AuthConfig::Static { token };
        }

        // Legacy name of the queue-size knob is still honoured
        if let Some(window) = env_parse("SUP_REORDER_WINDOW")
            .or_else(|| env_parse("SWIFT_UPLOAD_RUNNER_PROXY_Q_SIZE"))
        {
            config.reorder_window = window;
        }

        if let Some(secs) = env_parse("SUP_SESSION_IDLE_SECS") {
            config.session_idle_secs = secs;
        }

        if let Some(size) = env_parse("SUP_MAX_CHUNK_SIZE") {
            config.max_chunk_size = size;
        }

        if let Ok(level) = std::env::var("SUP_LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("SUP_CONFIG") {
            return Self::from_file(&path);
        }

        for path in &[
            "swift_upload_proxy.toml",
            "/etc/swift_upload_proxy/config.toml",
        ] {
            if std::path::Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject values the upload engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reorder_window == 0 {
            return Err(ConfigError::Invalid(
                "reorder_window must be at least 1".to_string(),
            ));
        }
        if let BackendConfig::Swift { storage_url, .. } = &self.backend {
            if !storage_url.starts_with("http://") && !storage_url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "storage_url must be an http(s) URL, got {}",
                    storage_url
                )));
            }
        }
        Ok(())
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
