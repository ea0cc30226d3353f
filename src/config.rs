use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

use crate::storage::{DEFAULT_CLEANUP_CHANCE, Expiration, sql::SqlDialect};

pub const PROJECT_CONFIG_FILENAME: &str = "reqvault.toml";
const HOME_CONFIG_DIR: &str = ".reqvault";
const HOME_CONFIG_FILENAME: &str = "config.toml";
const DEFAULT_STORAGE_PATH: &str = "storage/reqvault";
const DEFAULT_TABLE: &str = "reqvault";
const DEFAULT_KV_PREFIX: &str = "reqvault";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads `path` if given, else the first config found by discovery, else defaults.
    ///
    /// Discovery order: `./reqvault.toml`, then `$HOME/.reqvault/config.toml`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match discover_config_path() {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let chance = self.storage.cleanup_chance;
        if !(0.0..=1.0).contains(&chance) {
            anyhow::bail!("`storage.cleanup_chance` must be between 0 and 1, got {chance}");
        }
        if self.storage.sql.table.trim().is_empty() {
            anyhow::bail!("`storage.sql.table` cannot be empty");
        }
        if self.storage.kv.prefix.trim().is_empty() {
            anyhow::bail!("`storage.kv.prefix` cannot be empty");
        }
        if self.storage.backend == Backend::Redis && self.storage.kv.url.trim().is_empty() {
            anyhow::bail!("`storage.kv.url` cannot be empty for the redis backend");
        }
        Ok(())
    }
}

fn discover_config_path() -> Option<PathBuf> {
    let project = PathBuf::from(PROJECT_CONFIG_FILENAME);
    if project.is_file() {
        return Some(project);
    }
    let home = env::var_os("HOME")?;
    let home_config = PathBuf::from(home)
        .join(HOME_CONFIG_DIR)
        .join(HOME_CONFIG_FILENAME);
    home_config.is_file().then_some(home_config)
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    File,
    Sql,
    Redis,
    /// Process-local key-value store; nothing survives the process.
    Memory,
}

impl Backend {
    /// Whether stored requests outlive the process.
    pub fn is_persistent(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub expiration: Expiration,
    #[serde(default = "default_cleanup_chance")]
    pub cleanup_chance: f64,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub kv: KvConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            path: default_storage_path(),
            compress: false,
            expiration: Expiration::default(),
            cleanup_chance: DEFAULT_CLEANUP_CHANCE,
            sql: SqlConfig::default(),
            kv: KvConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub dialect: SqlDialect,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            dialect: SqlDialect::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvConfig {
    #[serde(default = "default_kv_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub cluster: bool,
    /// Server used by the `redis` backend.
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            prefix: default_kv_prefix(),
            cluster: false,
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_cleanup_chance() -> f64 {
    DEFAULT_CLEANUP_CHANCE
}

fn default_table() -> String {
    DEFAULT_TABLE.to_owned()
}

fn default_kv_prefix() -> String {
    DEFAULT_KV_PREFIX.to_owned()
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_owned()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{Backend, Config, LogFormat};
    use crate::storage::{Expiration, sql::SqlDialect};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");
        assert_eq!(config.storage.backend, Backend::File);
        assert_eq!(config.storage.path, Path::new("storage/reqvault"));
        assert_eq!(config.storage.expiration, Expiration::Minutes(10080));
        assert_eq!(config.storage.cleanup_chance, 0.01);
        assert_eq!(config.storage.sql.table, "reqvault");
        assert!(config.logging.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml_str(
            r#"
[storage]
backend = "sql"
path = "/tmp/reqvault.db"
compress = true
expiration = false
cleanup_chance = 1.0

[storage.sql]
table = "profiles"
dialect = "mysql"

[storage.kv]
prefix = "app"
cluster = true

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.storage.backend, Backend::Sql);
        assert!(config.storage.compress);
        assert_eq!(config.storage.expiration, Expiration::Off);
        assert_eq!(config.storage.sql.dialect, SqlDialect::Mysql);
        assert_eq!(config.storage.kv.prefix, "app");
        assert!(config.storage.kv.cluster);
        let logging = config.logging.expect("logging section");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn redis_backend_reads_the_server_url() {
        let config = Config::from_toml_str(
            r#"
[storage]
backend = "redis"

[storage.kv]
url = "redis://cache.internal:6380/2"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.storage.backend, Backend::Redis);
        assert!(config.storage.backend.is_persistent());
        assert!(!Backend::Memory.is_persistent());
        assert_eq!(config.storage.kv.url, "redis://cache.internal:6380/2");
        assert_eq!(Config::default().storage.kv.url, "redis://127.0.0.1:6379/");

        let err = Config::from_toml_str(
            r#"
[storage]
backend = "redis"

[storage.kv]
url = " "
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("storage.kv.url"), "error: {err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str(
            r#"
[storage]
backend = "file"
retention = 5
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("retention"), "error: {err:#}");
    }

    #[test]
    fn cleanup_chance_out_of_range_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[storage]
cleanup_chance = 2.0
"#,
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("cleanup_chance"),
            "error: {err}"
        );
    }
}
