//! Agent configuration: file loading, dedup retention and logging output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use agentwire_client::{RetryClientConfig, RouterConfig, SenderConfig, ServerType, StaticAuth};
use agentwire_protocol::secs;

/// Environment variable prefix for overrides, e.g. `AGENTWIRE__IDENTITY`.
pub const ENV_PREFIX: &str = "AGENTWIRE";

/// Everything an agent process reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identity, e.g. `rs-agent-1-1`
    pub identity: String,

    /// Router endpoints; requests are balanced across them
    pub router_urls: Vec<String>,

    /// Headers added to every router request
    pub headers: BTreeMap<String, String>,

    /// Retry client settings
    pub client: RetryClientConfig,

    /// Listen loop settings
    pub router: RouterConfig,

    /// Sender settings
    pub sender: SenderConfig,

    /// Duplicate suppression; `None` disables it
    pub dedup: Option<DedupConfig>,

    /// Log output
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            router_urls: Vec::new(),
            headers: BTreeMap::new(),
            client: RetryClientConfig::default(),
            router: RouterConfig::default(),
            sender: SenderConfig::default(),
            dedup: Some(DedupConfig::default()),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value parsed but makes no sense
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AgentConfig {
    /// Load configuration from a TOML, YAML or JSON file.
    ///
    /// Variables prefixed with `AGENTWIRE__` override file settings, with
    /// `__` separating nested keys: `AGENTWIRE__SENDER__OFFLINE_QUEUEING=true`.
    ///
    /// ```rust,no_run
    /// use agentwire_server::AgentConfig;
    ///
    /// let config = AgentConfig::from_file("agent.toml").expect("Failed to load config");
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, ENV_PREFIX)
    }

    /// Same as [`AgentConfig::from_file`] with a custom environment prefix.
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, Environment, File, FileFormat};

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        let name = path.to_str().ok_or(ConfigError::UnsupportedFormat)?;

        let config = Config::builder()
            .add_source(File::new(name, format))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check fields that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.is_empty() {
            return Err(ConfigError::Invalid("identity is required".to_string()));
        }
        self.router_endpoints().map(|_| ())
    }

    /// Parsed router endpoints.
    pub fn router_endpoints(&self) -> Result<Vec<Url>, ConfigError> {
        self.router_urls
            .iter()
            .map(|u| {
                Url::parse(u).map_err(|e| ConfigError::Invalid(format!("router url {u}: {e}")))
            })
            .collect()
    }

    /// Authorization provider built from the identity, endpoints and headers.
    pub fn static_auth(&self) -> Result<StaticAuth, ConfigError> {
        let auth = StaticAuth::new(self.identity.clone())
            .with_endpoints(ServerType::Router, self.router_endpoints()?);
        Ok(self
            .headers
            .iter()
            .fold(auth, |auth, (name, value)| auth.with_header(name, value)))
    }
}

/// Retention of dispatched tokens used to reject duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a token is remembered
    #[serde(with = "secs")]
    pub max_age: Duration,

    /// Upper bound on remembered tokens; least recently used are evicted first
    pub max_entries: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(12 * 60 * 60),
            max_entries: 100_000,
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    /// Logging disabled
    None,
    /// Standard error only
    #[default]
    Stderr,
    /// Rolling file only
    FileOnly,
    /// Standard error and a rolling file
    Both,
}

/// How often log files roll over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    /// Every minute
    Minute,
    /// Every hour
    Hourly,
    /// Every day
    Daily,
    /// Single file
    #[default]
    Never,
}

/// Logging configuration, applied with [`LoggingConfig::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines
    pub structured: bool,
    /// Output target
    pub output: LogOutput,
    /// Directory for log files
    pub directory: Option<PathBuf>,
    /// Log file name prefix
    pub file_prefix: String,
    /// File rotation
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
            output: LogOutput::Stderr,
            directory: None,
            file_prefix: "agentwire".to_string(),
            rotation: LogRotation::Never,
        }
    }
}

impl LoggingConfig {
    /// Errors only, to stderr.
    pub fn stderr_minimal() -> Self {
        Self {
            level: "error".to_string(),
            ..Self::default()
        }
    }

    /// Everything down to debug, to stderr.
    pub fn stderr_debug() -> Self {
        Self {
            level: "debug".to_string(),
            ..Self::default()
        }
    }

    /// JSON lines to stderr and an hourly file under `dir`.
    pub fn production(dir: impl Into<PathBuf>) -> Self {
        Self {
            structured: true,
            output: LogOutput::Both,
            directory: Some(dir.into()),
            rotation: LogRotation::Hourly,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(ext: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_dedup_defaults() {
        let config = DedupConfig::default();
        assert_eq!(config.max_age, Duration::from_secs(43_200));
        assert_eq!(config.max_entries, 100_000);
    }

    #[test]
    #[serial]
    fn test_from_toml_file() {
        let file = write_config(
            "toml",
            r#"
identity = "rs-agent-1-1"
router_urls = ["http://router-1:8080", "http://router-2:8080"]

[headers]
Authorization = "Bearer secret"

[sender]
offline_queueing = true

[dedup]
max_age = 60
max_entries = 10

[logging]
level = "debug"
output = "both"
directory = "/var/log/agent"
"#,
        );

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.identity, "rs-agent-1-1");
        assert_eq!(config.router_endpoints().unwrap().len(), 2);
        assert!(config.sender.offline_queueing);
        assert_eq!(
            config.dedup,
            Some(DedupConfig {
                max_age: Duration::from_secs(60),
                max_entries: 10,
            })
        );
        assert_eq!(config.logging.output, LogOutput::Both);
        assert_eq!(config.client, RetryClientConfig::default());
    }

    #[test]
    #[serial]
    #[allow(unsafe_code)]
    fn test_environment_overrides_file() {
        let file = write_config("json", r#"{"identity": "rs-agent-1-1"}"#);
        // SAFETY: serialized with every other test that touches the environment
        unsafe { std::env::set_var("AGENTWIRE_TEST__IDENTITY", "rs-agent-9-9") };
        let config = AgentConfig::from_file_with_prefix(file.path(), "AGENTWIRE_TEST");
        unsafe { std::env::remove_var("AGENTWIRE_TEST__IDENTITY") };
        assert_eq!(config.unwrap().identity, "rs-agent-9-9");
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        assert!(matches!(
            AgentConfig::from_file("/nonexistent/agent.toml"),
            Err(ConfigError::FileNotFound(_))
        ));
        let file = write_config("ini", "identity = x");
        assert!(matches!(
            AgentConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat)
        ));
    }

    #[test]
    #[serial]
    fn test_identity_required() {
        let file = write_config("yaml", "router_urls: []\n");
        assert!(matches!(
            AgentConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_router_url() {
        let config = AgentConfig {
            identity: "rs-agent-1-1".to_string(),
            router_urls: vec!["not a url".to_string()],
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.static_auth().is_err());
    }

    #[test]
    fn test_logging_presets() {
        let config = LoggingConfig::stderr_minimal();
        assert_eq!(config.level, "error");
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(config.directory.is_none());

        assert_eq!(LoggingConfig::stderr_debug().level, "debug");

        let config = LoggingConfig::production("/var/log/prod");
        assert_eq!(config.output, LogOutput::Both);
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert!(config.structured);
    }
}
