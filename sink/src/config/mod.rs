use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::types::error::SinkError;

pub const DEFAULT_STORE_HOST: &str = "localhost";
pub const DEFAULT_STORE_PORT: u16 = 27017;
pub const DEFAULT_STORE_DATABASE: &str = "mailsink";
pub const DEFAULT_STORE_COLLECTION: &str = "messages";
pub const DEFAULT_LISTEN_PORT: u16 = 25;
pub const DEFAULT_ADMIN_PORT: u16 = 8025;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MAILSINK_CONFIG";

/// Sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Keep an in-memory mirror of received mail next to the store
    #[serde(default = "default_true")]
    pub mirroring_enabled: bool,

    /// SMTP listen port (0 picks an ephemeral port)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Name announced in the SMTP greeting and Received headers
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Loopback HTTP listener for inspecting and trimming the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port on 127.0.0.1 (0 picks an ephemeral port)
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host. The embedded store only accepts loopback names.
    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    #[serde(default = "default_store_database")]
    pub database: String,

    #[serde(default = "default_store_collection")]
    pub collection: String,

    /// Directory holding the database file (default: platform data dir)
    pub data_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_admin_port() -> u16 {
    DEFAULT_ADMIN_PORT
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_store_host() -> String {
    DEFAULT_STORE_HOST.to_string()
}

fn default_store_port() -> u16 {
    DEFAULT_STORE_PORT
}

fn default_store_database() -> String {
    DEFAULT_STORE_DATABASE.to_string()
}

fn default_store_collection() -> String {
    DEFAULT_STORE_COLLECTION.to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mirroring_enabled: true,
            listen_port: DEFAULT_LISTEN_PORT,
            hostname: default_hostname(),
            store: StoreConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_ADMIN_PORT,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: DEFAULT_STORE_PORT,
            database: default_store_database(),
            collection: default_store_collection(),
            data_dir: None,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), SinkError> {
        validate_name("store.database", &self.store.database)?;
        validate_name("store.collection", &self.store.collection)?;
        if self.hostname.trim().is_empty() {
            return Err(SinkError::Config("hostname must not be empty".into()));
        }
        if self.admin.enabled && self.admin.port != 0 && self.admin.port == self.listen_port {
            return Err(SinkError::Config(format!(
                "admin.port and listen_port are both {}",
                self.listen_port
            )));
        }
        Ok(())
    }
}

impl StoreConfig {
    /// Directory the database file lives in
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mailsink")
        })
    }

    /// Human-readable store location for logs
    pub fn descriptor(&self) -> String {
        format!(
            "{}:{}/{}.{}",
            self.host, self.port, self.database, self.collection
        )
    }
}

fn validate_name(field: &str, value: &str) -> Result<(), SinkError> {
    if value.is_empty() {
        return Err(SinkError::Config(format!("{} must not be empty", field)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SinkError::Config(format!(
            "{} may only contain ASCII letters, digits, '_' and '-': {:?}",
            field, value
        )));
    }
    Ok(())
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailsink").join("config.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mailsink").join("config.toml"));
        paths.push(home_dir.join(".mailsink.toml"));
    }

    paths
}

/// Load configuration from `MAILSINK_CONFIG` or the default paths, falling
/// back to defaults when no file exists.
pub fn load_config() -> Result<SinkConfig, SinkError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return load_config_from_path(Path::new(&path));
    }

    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_config_from_path(&path);
        }
    }

    info!("No config file found, using defaults");
    Ok(SinkConfig::default())
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<SinkConfig, SinkError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| SinkError::Config(format!("Failed to read config: {}", e)))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<SinkConfig, SinkError> {
    let config: SinkConfig = toml::from_str(content)
        .map_err(|e| SinkError::Config(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.mirroring_enabled);
        assert_eq!(config.listen_port, 25);
        assert_eq!(config.store.host, "localhost");
        assert_eq!(config.store.port, 27017);
        assert_eq!(config.store.database, "mailsink");
        assert_eq!(config.store.collection, "messages");
        assert!(config.store.data_dir.is_none());
        assert!(config.admin.enabled);
        assert_eq!(config.admin.port, 8025);
    }

    #[test]
    fn test_admin_section() {
        let config = parse_config("[admin]\nenabled = false\nport = 9000\n").unwrap();
        assert!(!config.admin.enabled);
        assert_eq!(config.admin.port, 9000);
    }

    #[test]
    fn test_rejects_admin_port_clash() {
        let err = parse_config("listen_port = 2525\n[admin]\nport = 2525\n").unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
        assert!(parse_config("listen_port = 2525\n[admin]\nenabled = false\nport = 2525\n").is_ok());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config = parse_config(
            r#"
            mirroring_enabled = false
            listen_port = 2566

            [store]
            collection = "inbox"
            data_dir = "/tmp/sink"
            "#,
        )
        .unwrap();
        assert!(!config.mirroring_enabled);
        assert_eq!(config.listen_port, 2566);
        assert_eq!(config.store.collection, "inbox");
        assert_eq!(config.store.database, "mailsink");
        assert_eq!(config.store.resolved_data_dir(), PathBuf::from("/tmp/sink"));
    }

    #[test]
    fn test_rejects_bad_collection_name() {
        let err = parse_config("[store]\ncollection = \"a b\"\n").unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[test]
    fn test_rejects_unparseable_config() {
        assert!(matches!(
            parse_config("listen_port = \"smtp\""),
            Err(SinkError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "listen_port = 2525\n").unwrap();
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.listen_port, 2525);
    }
}
