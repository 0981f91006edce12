use crate::mapper::FileLayout;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Settings for the whole process, built once at startup.
/// This decouples the export logic from where the values came from.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// room_id → room name used in file names.
    pub rooms: BTreeMap<String, String>,
    pub database: DatabaseConfig,
    pub output_directory: PathBuf,
    pub daemon_interval: Duration,
    pub log_level: LevelFilter,
    pub file_layout: FileLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    Postgres {
        host: String,
        port: u16,
        name: String,
        user: String,
        password: String,
        connect_timeout: Duration,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl LoggerConfig {
    /// Room names used by more than one room id. Those rooms write to the
    /// same files.
    pub fn shared_room_names(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut shared = BTreeSet::new();
        for name in self.rooms.values() {
            if !seen.insert(name.as_str()) {
                shared.insert(name.as_str());
            }
        }
        shared.into_iter().collect()
    }
}

/// The file as written by operators. Keys are flat, matching the historical
/// `config.yaml`.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    rooms: BTreeMap<String, String>,
    db_backend: Option<String>,
    db_host: Option<String>,
    db_port: Option<u16>,
    db_name: Option<String>,
    db_user: Option<String>,
    db_password: Option<String>,
    db_connect_timeout: Option<u64>,
    db_path: Option<PathBuf>,
    output_directory: Option<PathBuf>,
    daemon_interval: Option<u64>,
    log_level: Option<String>,
    #[serde(default)]
    file_layout: FileLayout,
}

const DEFAULT_DAEMON_INTERVAL_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PG_PORT: u16 = 5432;

/// Finds the config file: explicit path, then `./config.yaml`, then the user
/// config directory.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        return Ok(p.to_path_buf());
    }

    let local = PathBuf::from("config.yaml");
    if local.exists() {
        return Ok(local);
    }

    dirs::config_dir()
        .map(|d| d.join("synapse-room-logger"))
        .into_iter()
        .flat_map(|d| [d.join("config.yaml"), d.join("config.toml")])
        .find(|p| p.exists())
        .ok_or_else(|| {
            eyre!("No configuration found.\nUse --config to specify one, or create ./config.yaml.")
        })
}

pub fn load_config(path: &Path) -> Result<LoggerConfig> {
    let content = fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read config: {}", path.display()))?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let raw: FileConfig = if is_toml {
        toml::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse config: {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse config: {}", path.display()))?
    };
    raw.validate()
        .wrap_err_with(|| format!("Invalid config: {}", path.display()))
}

/// Accepts Python-style names (`WARNING`, `CRITICAL`) as well as tracing's.
pub fn parse_log_level(level: &str) -> Result<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" | "critical" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        other => Err(eyre!("Unknown log_level: {:?}", other)),
    }
}

fn require(value: Option<String>, key: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| eyre!("`{}` is required for the postgres backend", key))
}

fn is_plain_file_stem(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

impl FileConfig {
    fn validate(self) -> Result<LoggerConfig> {
        if self.rooms.is_empty() {
            return Err(eyre!("`rooms` must list at least one room"));
        }
        for (id, name) in &self.rooms {
            if !is_plain_file_stem(name) {
                return Err(eyre!("room name {:?} of {} cannot be used in a file name", name, id));
            }
        }
        if self.file_layout == FileLayout::DateOnly && self.rooms.len() != 1 {
            return Err(eyre!("`file_layout: date_only` needs exactly one room"));
        }

        let output_directory = self
            .output_directory
            .ok_or_else(|| eyre!("`output_directory` is required"))?;

        let interval = self.daemon_interval.unwrap_or(DEFAULT_DAEMON_INTERVAL_SECS);
        if interval == 0 {
            return Err(eyre!("`daemon_interval` must be at least one second"));
        }

        let log_level = parse_log_level(self.log_level.as_deref().unwrap_or("INFO"))?;

        let database = match self.db_backend.as_deref().unwrap_or("postgres") {
            "postgres" | "postgresql" => {
                if !cfg!(feature = "postgres") {
                    return Err(eyre!("this build was compiled without PostgreSQL support"));
                }
                DatabaseConfig::Postgres {
                    host: require(self.db_host, "db_host")?,
                    port: self.db_port.unwrap_or(DEFAULT_PG_PORT),
                    name: require(self.db_name, "db_name")?,
                    user: require(self.db_user, "db_user")?,
                    password: self.db_password.unwrap_or_default(),
                    connect_timeout: Duration::from_secs(
                        self.db_connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
                    ),
                }
            }
            "sqlite" => DatabaseConfig::Sqlite {
                path: self
                    .db_path
                    .ok_or_else(|| eyre!("`db_path` is required for the sqlite backend"))?,
            },
            other => return Err(eyre!("Unknown db_backend: {:?}", other)),
        };

        Ok(LoggerConfig {
            rooms: self.rooms,
            database,
            output_directory,
            daemon_interval: Duration::from_secs(interval),
            log_level,
            file_layout: self.file_layout,
        })
    }
}
