use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const CONFIG_PATH_ENV: &str = "SVCLINK_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "svclink.toml";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub keepalive: KeepaliveConfig,
    pub auth: AuthConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            wire: WireConfig::default(),
            keepalive: KeepaliveConfig::default(),
            auth: AuthConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 7600,
            poll_interval_ms: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_frame_size_bytes: usize,
    pub chunk_size_bytes: usize,
    pub codec_workers: usize,
    pub codec_queue_budget_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_size_bytes: 8 * 1024 * 1024,
            chunk_size_bytes: 16 * 1024,
            codec_workers: 2,
            codec_queue_budget_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub ping_interval_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub secret: String,
    pub token_ttl_hours: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_hours: 12,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub force_exit_after_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            force_exit_after_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Loads configuration from the path named by `SVCLINK_CONFIG`, falling
    /// back to `./svclink.toml`, falling back to built-in defaults when no
    /// file exists. CLI overrides apply in every case.
    pub fn discover(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        match explicit {
            Some(path) => Self::load_from_toml_with_args(path, args),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_toml_with_args(default_path, args)
                } else {
                    Self::from_defaults_with_args(args)
                }
            }
        }
    }

    pub fn from_defaults_with_args(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value =
            Value::try_from(AppConfigSeed::default()).map_err(ConfigError::Serialize)?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        // Missing sections and keys fall back to defaults before overrides
        // apply, so `--server.port 9000` works against a minimal file.
        let file_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.as_ref().to_string_lossy().to_string(),
                source,
            })?;
        let mut root_value =
            Value::try_from(AppConfigSeed::default()).map_err(ConfigError::Serialize)?;
        merge_tables(&mut root_value, file_value);

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

/// Serializable mirror of the defaults, used to seed the TOML tree that
/// overrides are applied against.
#[derive(serde::Serialize)]
struct AppConfigSeed {
    logging: LoggingSeed,
    server: ServerSeed,
    wire: WireSeed,
    keepalive: KeepaliveSeed,
    auth: AuthSeed,
    shutdown: ShutdownSeed,
}

#[derive(serde::Serialize)]
struct LoggingSeed {
    level: String,
    human_friendly: bool,
}

#[derive(serde::Serialize)]
struct ServerSeed {
    host: String,
    port: i64,
    poll_interval_ms: i64,
}

#[derive(serde::Serialize)]
struct WireSeed {
    max_frame_size_bytes: i64,
    chunk_size_bytes: i64,
    codec_workers: i64,
    codec_queue_budget_bytes: i64,
}

#[derive(serde::Serialize)]
struct KeepaliveSeed {
    ping_interval_ms: i64,
}

#[derive(serde::Serialize)]
struct AuthSeed {
    secret: String,
    token_ttl_hours: i64,
}

#[derive(serde::Serialize)]
struct ShutdownSeed {
    force_exit_after_ms: i64,
}

impl Default for AppConfigSeed {
    fn default() -> Self {
        let defaults = AppConfig::default();
        Self {
            logging: LoggingSeed {
                level: defaults.logging.level,
                human_friendly: defaults.logging.human_friendly,
            },
            server: ServerSeed {
                host: defaults.server.host,
                port: defaults.server.port as i64,
                poll_interval_ms: defaults.server.poll_interval_ms as i64,
            },
            wire: WireSeed {
                max_frame_size_bytes: defaults.wire.max_frame_size_bytes as i64,
                chunk_size_bytes: defaults.wire.chunk_size_bytes as i64,
                codec_workers: defaults.wire.codec_workers as i64,
                codec_queue_budget_bytes: defaults.wire.codec_queue_budget_bytes as i64,
            },
            keepalive: KeepaliveSeed {
                ping_interval_ms: defaults.keepalive.ping_interval_ms as i64,
            },
            auth: AuthSeed {
                secret: defaults.auth.secret,
                token_ttl_hours: defaults.auth.token_ttl_hours as i64,
            },
            shutdown: ShutdownSeed {
                force_exit_after_ms: defaults.shutdown.force_exit_after_ms as i64,
            },
        }
    }
}

fn merge_tables(base: &mut Value, overlay: Value) {
    let (Value::Table(base_table), Value::Table(overlay_table)) = (&mut *base, overlay) else {
        return;
    };
    for (key, overlay_value) in overlay_table {
        match base_table.get_mut(&key) {
            Some(base_value) if base_value.is_table() && overlay_value.is_table() => {
                merge_tables(base_value, overlay_value);
            }
            _ => {
                base_table.insert(key, overlay_value);
            }
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => write!(f, "failed to serialize default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table
            .get_mut(*section)
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
