//! Configuration system for the callrelay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/callrelay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A resolved value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    reaper: ReaperFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    host: Option<String>,
    port: Option<u16>,
    allowed_origins: Option<Vec<String>>,
    max_message_size: Option<usize>,
    outbound_queue_size: Option<usize>,
}

/// `[reaper]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReaperFileConfig {
    interval_secs: Option<u64>,
    call_ttl_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "callrelay signaling server")]
pub struct RelayCliArgs {
    /// Host address to bind to.
    #[arg(long, env = "CALLRELAY_HOST")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Path to config file (default: `~/.config/callrelay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Origin allowed to connect from a browser. Repeat for several; `*` allows any.
    #[arg(
        long = "allowed-origin",
        env = "CALLRELAY_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    /// Seconds between reaper sweeps.
    #[arg(long)]
    pub reaper_interval_secs: Option<u64>,

    /// Maximum age of a tracked call, in seconds.
    #[arg(long)]
    pub call_ttl_secs: Option<u64>,

    /// Maximum inbound frame size in bytes.
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Outbound frames buffered per peer before delivery fails.
    #[arg(long)]
    pub outbound_queue_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CALLRELAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Origin policy
// ---------------------------------------------------------------------------

/// Which browser origins may open connections or read the HTTP views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Any origin, and requests without an `Origin` header.
    Any,
    /// Only the listed origins (compared without a trailing slash).
    List(Vec<String>),
}

impl OriginPolicy {
    /// Builds a policy from configured origins. An empty list or a `*`
    /// entry means [`OriginPolicy::Any`].
    #[must_use]
    pub fn from_origins(origins: &[String]) -> Self {
        if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
            return Self::Any;
        }
        Self::List(
            origins
                .iter()
                .map(|o| normalize_origin(o).to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        )
    }

    /// Whether a request carrying this `Origin` header value is allowed.
    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::List(allowed) => {
                let origin = normalize_origin(origin);
                allowed.iter().any(|a| a == origin)
            }
        }
    }
}

fn normalize_origin(origin: &str) -> &str {
    origin.trim().trim_end_matches('/')
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host address to bind to (e.g., `0.0.0.0`).
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Cross-origin policy for WebSocket upgrades and HTTP views.
    pub origins: OriginPolicy,
    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
    /// Age after which a tracked call is evicted.
    pub call_ttl: Duration,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per peer.
    pub outbound_queue_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            origins: OriginPolicy::Any,
            reaper_interval: Duration::from_secs(30),
            call_ttl: Duration::from_secs(5 * 60),
            max_message_size: 64 * 1024,
            outbound_queue_size: 256,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a resolved value is zero where it must be positive.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// The `host:port` socket address string to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        let origins = if cli.allowed_origins.is_empty() {
            file.server
                .allowed_origins
                .as_deref()
                .map_or(defaults.origins, OriginPolicy::from_origins)
        } else {
            OriginPolicy::from_origins(&cli.allowed_origins)
        };

        Self {
            host: cli
                .host
                .clone()
                .or_else(|| file.server.host.clone())
                .unwrap_or(defaults.host),
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            origins,
            reaper_interval: cli
                .reaper_interval_secs
                .or(file.reaper.interval_secs)
                .map_or(defaults.reaper_interval, Duration::from_secs),
            call_ttl: cli
                .call_ttl_secs
                .or(file.reaper.call_ttl_secs)
                .map_or(defaults.call_ttl, Duration::from_secs),
            max_message_size: cli
                .max_message_size
                .or(file.server.max_message_size)
                .unwrap_or(defaults.max_message_size),
            outbound_queue_size: cli
                .outbound_queue_size
                .or(file.server.outbound_queue_size)
                .unwrap_or(defaults.outbound_queue_size),
            log_level: cli.log_level.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid("reaper interval must be positive".into()));
        }
        if self.call_ttl.is_zero() {
            return Err(ConfigError::Invalid("call TTL must be positive".into()));
        }
        if self.outbound_queue_size == 0 {
            return Err(ConfigError::Invalid("outbound queue size must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("callrelay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
