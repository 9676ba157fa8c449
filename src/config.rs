use los_sync_core::Side;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Connection to the desktop/server store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Server URL (e.g., "http://localhost:3001")
    pub server_url: Option<String>,
    /// API key sent as a bearer token, if the server requires one
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl ServerConfig {
    /// Returns true if a server URL is set
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some()
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the local SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Side that wins when both copies of a row share an updatedAt
    pub authority: ConfigValue<Side>,
    /// Upper bound for one sync run, in seconds (0 disables it)
    pub timeout_secs: ConfigValue<u64>,
    /// Directory for sync summary files (none written when unset)
    pub summary_dir: ConfigValue<Option<PathBuf>>,
    /// Directory for database backups taken before each sync (none when unset)
    pub backup_dir: ConfigValue<Option<PathBuf>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Server connection
    pub server: ServerConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    authority: Option<String>,
    timeout_secs: Option<u64>,
    summary_dir: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    server: Option<ServerConfig>,
}

const DEFAULT_TIMEOUT_SECS: u64 = 60;

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("los.db"),
            ConfigSource::Default,
        );
        let mut authority = ConfigValue::new(Side::Local, ConfigSource::Default);
        let mut timeout_secs = ConfigValue::new(DEFAULT_TIMEOUT_SECS, ConfigSource::Default);
        let mut summary_dir = ConfigValue::new(None, ConfigSource::Default);
        let mut backup_dir = ConfigValue::new(None, ConfigSource::Default);
        let mut config_file = None;
        let mut server = ServerConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                database_path = ConfigValue::new(resolve(&path, db_path), ConfigSource::File);
            }
            if let Some(side) = file_config.authority {
                let side = side
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("authority".to_string(), side))?;
                authority = ConfigValue::new(side, ConfigSource::File);
            }
            if let Some(secs) = file_config.timeout_secs {
                timeout_secs = ConfigValue::new(secs, ConfigSource::File);
            }
            if let Some(dir) = file_config.summary_dir {
                summary_dir = ConfigValue::new(Some(resolve(&path, dir)), ConfigSource::File);
            }
            if let Some(dir) = file_config.backup_dir {
                backup_dir = ConfigValue::new(Some(resolve(&path, dir)), ConfigSource::File);
            }
            if let Some(server_config) = file_config.server {
                server = server_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("LOS_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(side) = std::env::var("LOS_AUTHORITY") {
            let parsed = side
                .parse()
                .map_err(|_| ConfigError::InvalidValue("LOS_AUTHORITY".to_string(), side))?;
            authority = ConfigValue::new(parsed, ConfigSource::Environment);
        }
        if let Ok(secs) = std::env::var("LOS_SYNC_TIMEOUT_SECS") {
            let parsed = secs.parse().map_err(|_| {
                ConfigError::InvalidValue("LOS_SYNC_TIMEOUT_SECS".to_string(), secs)
            })?;
            timeout_secs = ConfigValue::new(parsed, ConfigSource::Environment);
        }
        if let Ok(dir) = std::env::var("LOS_SUMMARY_DIR") {
            summary_dir = ConfigValue::new(Some(PathBuf::from(dir)), ConfigSource::Environment);
        }
        if let Ok(dir) = std::env::var("LOS_BACKUP_DIR") {
            backup_dir = ConfigValue::new(Some(PathBuf::from(dir)), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("LOS_SERVER_URL") {
            server.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("LOS_API_KEY") {
            server.api_key = Some(key);
        }

        Ok(Self {
            database_path,
            authority,
            timeout_secs,
            summary_dir,
            backup_dir,
            config_file,
            server,
        })
    }

    /// Sync deadline, or `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs.value {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/los/
    /// - macOS: ~/Library/Application Support/los/
    /// - Windows: %APPDATA%/los/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("los")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/los/
    /// - macOS: ~/Library/Application Support/los/
    /// - Windows: %APPDATA%/los/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("los")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

/// Resolve relative paths against the config file's directory
fn resolve(config_path: &std::path::Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        config_path
            .parent()
            .map(|p| p.join(&path))
            .unwrap_or(path)
    } else {
        path
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError(_, e) => Some(e),
            ConfigError::ParseError(_, e) => Some(e),
            ConfigError::InvalidValue(..) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("los.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.timeout_secs.value, 60);
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/los.sqlite").unwrap();
        writeln!(file, "authority: desktop").unwrap();
        writeln!(file, "timeout_secs: 0").unwrap();
        writeln!(file, "summary_dir: summaries").unwrap();
        writeln!(file, "backup_dir: /var/backups/los").unwrap();
        writeln!(file, "server:").unwrap();
        writeln!(file, "  server_url: http://localhost:3001").unwrap();
        writeln!(file, "  api_key: secret").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/los.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.authority.value, Side::Remote);
        assert_eq!(config.authority.source, ConfigSource::File);
        assert_eq!(config.timeout(), None);
        assert_eq!(
            config.summary_dir.value,
            Some(temp_dir.path().join("summaries"))
        );
        assert_eq!(
            config.backup_dir.value,
            Some(PathBuf::from("/var/backups/los"))
        );
        assert_eq!(config.backup_dir.source, ConfigSource::File);
        assert!(config.server.is_configured());
        assert_eq!(config.server.api_key.as_deref(), Some("secret"));
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server:").unwrap();
        writeln!(file, "  api_key: secret").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "authority: local").unwrap();

        // Set env var
        std::env::set_var("LOS_AUTHORITY", "remote");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.authority.value, Side::Remote);
        assert_eq!(config.authority.source, ConfigSource::Environment);

        // Clean up
        std::env::remove_var("LOS_AUTHORITY");
    }

    #[test]
    fn test_invalid_authority_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "authority: both").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("Invalid value for authority"));
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
