//! User configuration: loading, validation, migration and crash-safe saving.
//!
//! ## Config File Location
//!
//! `$WSLSHOT_CONFIG` if set, otherwise `~/.config/wslshot/config.json`. The
//! global `--config` flag overrides both.
//!
//! ## Configuration Options
//!
//! ```json
//! {
//!     "default_source": "/mnt/c/Users/me/Pictures/Screenshots",
//!     "default_destination": "",
//!     "auto_stage_enabled": false,
//!     "default_output_format": "markdown",
//!     "default_convert_to": null,
//!     "max_file_size_mb": null,
//!     "max_total_size_mb": null
//! }
//! ```
//!
//! | Key | Type | Default |
//! |---|---|---|
//! | `default_source` | string | `""` |
//! | `default_destination` | string | `""` (auto-detect) |
//! | `auto_stage_enabled` | bool | `false` |
//! | `default_output_format` | `markdown` \| `html` \| `text` | `markdown` |
//! | `default_convert_to` | `png` \| `jpg` \| `webp` \| `gif` \| null | null |
//! | `max_file_size_mb` | number \| null | null (50 MB) |
//! | `max_total_size_mb` | number \| null | null (200 MB) |
//!
//! ## Loading Rules
//!
//! The same rules run for [`ConfigStore::load`] and
//! [`ConfigStore::load_read_only`]:
//!
//! - A file that is not a JSON object is corrupted. `load` renames it to
//!   `config.json.corrupt.<unix-time>` and continues with defaults;
//!   `load_read_only` leaves it alone. Neither fails, even when the rename
//!   does.
//! - A recognized key with the wrong type or an out-of-range value is reset to
//!   its default. The rest of the file is kept.
//! - Unknown keys are kept verbatim for newer versions. Saving a loaded
//!   config keeps every key where the file had it.
//! - Legacy values (`plain_text`, `jpeg`) are understood but only rewritten
//!   by [`ConfigStore::migrate`].
//!
//! Nothing is written on load apart from the corruption backup. Saving goes
//! through [`write_atomic`] with owner-only permissions.

use crate::atomic::{OWNER_ONLY, Replace, sync_dir, write_atomic};
use crate::imaging::format::ConvertTarget;
use crate::limits::SizeLimits;
use crate::output::OutputStyle;
use crate::paths::{PathError, PathRole, authorize, create_dir_safely};
use crate::sanitize::redact;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Number, Value};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "WSLSHOT_CONFIG";

/// Recognized keys, in the order they are written.
pub mod keys {
    pub const DEFAULT_SOURCE: &str = "default_source";
    pub const DEFAULT_DESTINATION: &str = "default_destination";
    pub const AUTO_STAGE_ENABLED: &str = "auto_stage_enabled";
    pub const DEFAULT_OUTPUT_FORMAT: &str = "default_output_format";
    pub const DEFAULT_CONVERT_TO: &str = "default_convert_to";
    pub const MAX_FILE_SIZE_MB: &str = "max_file_size_mb";
    pub const MAX_TOTAL_SIZE_MB: &str = "max_total_size_mb";

    /// Former name of `default_output_format`.
    pub const LEGACY_OUTPUT_STYLE: &str = "output_style";
}

const LEGACY_PLAIN_TEXT: &str = "plain_text";
const LEGACY_JPEG: &str = "jpeg";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("No config file found at {}", redact(.0))]
    Missing(PathBuf),
    #[error("Cannot read config {}: {source}", redact(path))]
    Unreadable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid config format in {}: expected a JSON object", redact(.0))]
    NotAnObject(PathBuf),
    #[error("Cannot write config {}: {source}", redact(path))]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

impl ConfigError {
    /// Failures of the disk itself rather than of the file's contents.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Write { .. } | Self::Path(PathError::Io { .. })
        )
    }
}

/// User configuration with every recognized key present.
#[derive(Debug, Clone)]
pub struct Config {
    pub default_source: String,
    pub default_destination: String,
    pub auto_stage_enabled: bool,
    pub default_output_format: OutputStyle,
    pub default_convert_to: Option<ConvertTarget>,
    /// Kept as the JSON number that was read so an unchanged file saves
    /// back byte for byte. Clamped in [`Config::limits`].
    pub max_file_size_mb: Option<Number>,
    pub max_total_size_mb: Option<Number>,
    /// Unrecognized keys, in file order.
    pub extra: Map<String, Value>,
    /// Every key as it appeared in the file. Empty for a config built in
    /// code. Only affects where keys land on save, not equality.
    key_order: Vec<String>,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.default_source == other.default_source
            && self.default_destination == other.default_destination
            && self.auto_stage_enabled == other.auto_stage_enabled
            && self.default_output_format == other.default_output_format
            && self.default_convert_to == other.default_convert_to
            && self.max_file_size_mb == other.max_file_size_mb
            && self.max_total_size_mb == other.max_total_size_mb
            && self.extra == other.extra
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_source: String::new(),
            default_destination: String::new(),
            auto_stage_enabled: false,
            default_output_format: OutputStyle::Markdown,
            default_convert_to: None,
            max_file_size_mb: None,
            max_total_size_mb: None,
            extra: Map::new(),
            key_order: Vec::new(),
        }
    }
}

impl Config {
    /// Size limits, clamped to the hard ceilings on every call.
    pub fn limits(&self) -> SizeLimits {
        SizeLimits::new(
            self.max_file_size_mb.as_ref().and_then(Number::as_f64),
            self.max_total_size_mb.as_ref().and_then(Number::as_f64),
        )
    }

    /// Keys in the order they were read. Schema keys the file lacked follow
    /// in schema order, then any unknown keys added since loading.
    pub fn to_value(&self) -> Value {
        let mut fields = self.schema_fields();
        let mut extra = self.extra.clone();
        let mut map = Map::new();
        for key in &self.key_order {
            if let Some(value) = fields.shift_remove(key).or_else(|| extra.shift_remove(key)) {
                map.insert(key.clone(), value);
            }
        }
        map.extend(fields);
        map.extend(extra);
        Value::Object(map)
    }

    fn schema_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            keys::DEFAULT_SOURCE.into(),
            Value::String(self.default_source.clone()),
        );
        map.insert(
            keys::DEFAULT_DESTINATION.into(),
            Value::String(self.default_destination.clone()),
        );
        map.insert(
            keys::AUTO_STAGE_ENABLED.into(),
            Value::Bool(self.auto_stage_enabled),
        );
        map.insert(
            keys::DEFAULT_OUTPUT_FORMAT.into(),
            Value::String(self.default_output_format.as_str().into()),
        );
        map.insert(
            keys::DEFAULT_CONVERT_TO.into(),
            self.default_convert_to
                .map_or(Value::Null, |t| Value::String(t.extension().into())),
        );
        map.insert(
            keys::MAX_FILE_SIZE_MB.into(),
            self.max_file_size_mb.clone().map_or(Value::Null, Value::Number),
        );
        map.insert(
            keys::MAX_TOTAL_SIZE_MB.into(),
            self.max_total_size_mb.clone().map_or(Value::Null, Value::Number),
        );
        map
    }

    /// The exact bytes [`ConfigStore::save`] writes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        to_pretty_json(&self.to_value())
    }
}

/// Four-space indented JSON with a trailing newline.
fn to_pretty_json(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Something noticed while loading. None of these are fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigIssue {
    /// The file was not a JSON object. `backup` is where it was moved, if
    /// this was not a read-only load.
    Corrupted {
        reason: String,
        backup: Option<PathBuf>,
    },
    /// A recognized key held an invalid value and was reset to its default.
    InvalidKey { key: String, reason: String },
    UnknownKey(String),
    LegacyValue {
        key: &'static str,
        old: String,
        new: &'static str,
    },
    LegacyKey {
        old: &'static str,
        new: &'static str,
    },
    InsecurePermissions { mode: u32 },
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupted {
                reason,
                backup: Some(backup),
            } => write!(
                f,
                "Config file is corrupted ({reason}); backed up to {} and reset to defaults",
                redact(backup)
            ),
            Self::Corrupted { reason, backup: None } => {
                write!(f, "Config file is corrupted ({reason}); using defaults")
            }
            Self::InvalidKey { key, reason } => {
                write!(f, "Invalid value for '{key}' ({reason}); using default")
            }
            Self::UnknownKey(key) => write!(f, "Unknown config key '{key}' (kept as is)"),
            Self::LegacyValue { key, old, new } => write!(
                f,
                "'{key}' uses deprecated value '{old}' (treated as '{new}'); run `wslshot migrate-config`"
            ),
            Self::LegacyKey { old, new } => write!(
                f,
                "Config key '{old}' is deprecated (use '{new}'); run `wslshot migrate-config`"
            ),
            Self::InsecurePermissions { mode } => write!(
                f,
                "Config file permissions are {mode:o}; expected 600 (owner only)"
            ),
        }
    }
}

/// A config plus whatever was noticed while loading it.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub config: Config,
    pub issues: Vec<ConfigIssue>,
}

/// Outcome of [`ConfigStore::migrate`].
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    /// One `key: 'old' → 'new'` line per change.
    pub changes: Vec<String>,
    /// Whether the file was rewritten.
    pub applied: bool,
    /// The migrated document, written or not.
    pub preview: Map<String, Value>,
}

/// Explicit changes from the `configure` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub auto_stage_enabled: Option<bool>,
    pub output_style: Option<OutputStyle>,
    /// `Some(None)` clears the default conversion.
    pub convert_to: Option<Option<ConvertTarget>>,
    pub max_file_size_mb: Option<f64>,
    pub max_total_size_mb: Option<f64>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// `$WSLSHOT_CONFIG`, or `~/.config/wslshot/config.json`.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .ok_or(PathError::NoHome)?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("wslshot")
        .join("config.json"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Persist,
    ReadOnly,
}

/// Owner and sole writer of the config file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::new(default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load for a run that may persist changes. A corrupted file is moved
    /// aside before defaults are returned.
    ///
    /// `allow_symlinks` applies to the config path the same way it does to
    /// source and destination directories.
    pub fn load(&self, allow_symlinks: bool) -> Result<Loaded, ConfigError> {
        self.load_with(LoadMode::Persist, allow_symlinks)
    }

    /// Load for display only. Never writes, renames or creates anything.
    pub fn load_read_only(&self, allow_symlinks: bool) -> Result<Loaded, ConfigError> {
        self.load_with(LoadMode::ReadOnly, allow_symlinks)
    }

    fn load_with(&self, mode: LoadMode, allow_symlinks: bool) -> Result<Loaded, ConfigError> {
        let path = authorize(&self.path, PathRole::ConfigFile, allow_symlinks)?.into_path_buf();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %redact(&path), "no config file, using defaults");
                return Ok(Loaded {
                    config: Config::default(),
                    issues: Vec::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut issues = Vec::new();
        if let Some(mode) = insecure_mode(&path)? {
            issues.push(ConfigIssue::InsecurePermissions { mode });
        }

        let config = match parse_object(&bytes) {
            Ok(map) => {
                let (config, key_issues) = validate_map(map);
                issues.extend(key_issues);
                config
            }
            Err(reason) => {
                let backup = match mode {
                    LoadMode::Persist => match back_up_corrupt(&path) {
                        Ok(backup) => Some(backup),
                        Err(e) => {
                            warn!(path = %redact(&path), error = %e, "could not move corrupted config aside");
                            None
                        }
                    },
                    LoadMode::ReadOnly => None,
                };
                issues.push(ConfigIssue::Corrupted { reason, backup });
                Config::default()
            }
        };

        for issue in &issues {
            warn!("{}", crate::sanitize::sanitize_message(&issue.to_string()));
        }
        Ok(Loaded { config, issues })
    }

    /// Atomically replace the config file with `config`.
    pub fn save(&self, config: &Config, allow_symlinks: bool) -> Result<(), ConfigError> {
        let path = authorize(&self.path, PathRole::ConfigFile, allow_symlinks)?.into_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_safely(parent, allow_symlinks)?;
        }
        let bytes = config.to_json()?;
        write_atomic(&path, &bytes, OWNER_ONLY, Replace::Overwrite).map_err(|source| {
            ConfigError::Write {
                path: path.clone(),
                source,
            }
        })?;
        info!(path = %redact(&path), "config saved");
        Ok(())
    }

    /// Apply `update` on top of the current config and save the result.
    /// Source and destination are authorized and stored canonical.
    pub fn apply(&self, update: &ConfigUpdate, allow_symlinks: bool) -> Result<Config, ConfigError> {
        let mut config = self.load(allow_symlinks)?.config;

        if let Some(source) = &update.source {
            let dir = authorize(source, PathRole::SourceDir, allow_symlinks)?;
            config.default_source = dir.as_path().to_string_lossy().into_owned();
        }
        if let Some(destination) = &update.destination {
            let dir = authorize(destination, PathRole::DestinationDir, allow_symlinks)?;
            config.default_destination = dir.as_path().to_string_lossy().into_owned();
        }
        if let Some(enabled) = update.auto_stage_enabled {
            config.auto_stage_enabled = enabled;
        }
        if let Some(style) = update.output_style {
            config.default_output_format = style;
        }
        if let Some(target) = update.convert_to {
            config.default_convert_to = target;
        }
        if let Some(mb) = update.max_file_size_mb {
            config.max_file_size_mb = Some(megabytes(keys::MAX_FILE_SIZE_MB, mb)?);
        }
        if let Some(mb) = update.max_total_size_mb {
            config.max_total_size_mb = Some(megabytes(keys::MAX_TOTAL_SIZE_MB, mb)?);
        }

        self.save(&config, allow_symlinks)?;
        Ok(config)
    }

    /// Rewrite legacy keys and values. With `dry_run` the file is left alone
    /// and the report only describes what would change.
    pub fn migrate(&self, dry_run: bool, allow_symlinks: bool) -> Result<MigrationReport, ConfigError> {
        let path = authorize(&self.path, PathRole::ConfigFile, allow_symlinks)?.into_path_buf();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path));
            }
            Err(e) => return Err(e.into()),
        };
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Unreadable {
                path: path.clone(),
                source,
            })?;
        let Value::Object(map) = value else {
            return Err(ConfigError::NotAnObject(path));
        };

        let (mut preview, renamed) = rename_legacy_keys(map);
        let mut changes = Vec::new();
        if renamed {
            changes.push(format!(
                "{} → {}",
                keys::LEGACY_OUTPUT_STYLE,
                keys::DEFAULT_OUTPUT_FORMAT
            ));
        }
        changes.extend(migrate_values(&mut preview));

        let applied = !dry_run && !changes.is_empty();
        if applied {
            let bytes = to_pretty_json(&Value::Object(preview.clone()))?;
            write_atomic(&path, &bytes, OWNER_ONLY, Replace::Overwrite).map_err(|source| {
                ConfigError::Write {
                    path: path.clone(),
                    source,
                }
            })?;
            info!(path = %redact(&path), changes = changes.len(), "config migrated");
        }
        Ok(MigrationReport {
            changes,
            applied,
            preview,
        })
    }
}

fn megabytes(key: &'static str, value: f64) -> Result<Number, ConfigError> {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        return Ok(Number::from(value as i64));
    }
    Number::from_f64(value).ok_or_else(|| ConfigError::InvalidValue {
        key,
        reason: format!("{value} is not a finite number"),
    })
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, found {}", json_type(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Move a corrupted file to `<name>.corrupt.<unix-time>` next to it.
fn back_up_corrupt(path: &Path) -> io::Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config.json".to_string());

    let mut backup = path.with_file_name(format!("{name}.corrupt.{stamp}"));
    let mut attempt = 1;
    while fs::symlink_metadata(&backup).is_ok() {
        backup = path.with_file_name(format!("{name}.corrupt.{stamp}.{attempt}"));
        attempt += 1;
    }
    fs::rename(path, &backup)?;
    if let Some(dir) = path.parent() {
        if let Err(e) = sync_dir(dir) {
            debug!(error = %e, "could not sync config directory after backup");
        }
    }
    Ok(backup)
}

#[cfg(unix)]
fn insecure_mode(path: &Path) -> Result<Option<u32>, ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    Ok((mode & 0o077 != 0).then_some(mode))
}

#[cfg(not(unix))]
fn insecure_mode(_path: &Path) -> Result<Option<u32>, ConfigError> {
    Ok(None)
}

/// Rename `output_style` to `default_output_format` in place. When both are
/// present the current key wins and the legacy one is dropped.
fn rename_legacy_keys(map: Map<String, Value>) -> (Map<String, Value>, bool) {
    if !map.contains_key(keys::LEGACY_OUTPUT_STYLE) {
        return (map, false);
    }
    let has_current = map.contains_key(keys::DEFAULT_OUTPUT_FORMAT);
    let renamed = map
        .into_iter()
        .filter_map(|(key, value)| {
            if key != keys::LEGACY_OUTPUT_STYLE {
                Some((key, value))
            } else if has_current {
                None
            } else {
                Some((keys::DEFAULT_OUTPUT_FORMAT.to_string(), value))
            }
        })
        .collect();
    (renamed, true)
}

/// Legacy value rewrites, applied in place.
fn migrate_values(map: &mut Map<String, Value>) -> Vec<String> {
    const RULES: [(&str, &str, &str); 2] = [
        (keys::DEFAULT_OUTPUT_FORMAT, LEGACY_PLAIN_TEXT, "text"),
        (keys::DEFAULT_CONVERT_TO, LEGACY_JPEG, "jpg"),
    ];
    let mut changes = Vec::new();
    for (key, old, new) in RULES {
        let Some(value) = map.get_mut(key) else {
            continue;
        };
        let matches = value
            .as_str()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(old));
        if matches {
            *value = Value::String(new.to_string());
            changes.push(format!("{key}: '{old}' → '{new}'"));
        }
    }
    changes
}

fn invalid(key: &str, expected: &str, found: &Value) -> ConfigIssue {
    ConfigIssue::InvalidKey {
        key: key.to_string(),
        reason: format!("expected {expected}, found {found}"),
    }
}

/// Apply the schema to a parsed object.
fn validate_map(map: Map<String, Value>) -> (Config, Vec<ConfigIssue>) {
    let mut issues = Vec::new();
    let (map, renamed) = rename_legacy_keys(map);
    if renamed {
        issues.push(ConfigIssue::LegacyKey {
            old: keys::LEGACY_OUTPUT_STYLE,
            new: keys::DEFAULT_OUTPUT_FORMAT,
        });
    }

    let mut config = Config {
        key_order: map.keys().cloned().collect(),
        ..Config::default()
    };
    for (key, value) in map {
        match key.as_str() {
            keys::DEFAULT_SOURCE | keys::DEFAULT_DESTINATION => match value {
                Value::String(s) if key == keys::DEFAULT_SOURCE => config.default_source = s,
                Value::String(s) => config.default_destination = s,
                other => issues.push(invalid(&key, "a string", &other)),
            },
            keys::AUTO_STAGE_ENABLED => match value {
                Value::Bool(b) => config.auto_stage_enabled = b,
                other => issues.push(invalid(&key, "a boolean", &other)),
            },
            keys::DEFAULT_OUTPUT_FORMAT => match value.as_str() {
                Some(s) if s.trim().eq_ignore_ascii_case(LEGACY_PLAIN_TEXT) => {
                    config.default_output_format = OutputStyle::Text;
                    issues.push(ConfigIssue::LegacyValue {
                        key: keys::DEFAULT_OUTPUT_FORMAT,
                        old: s.to_string(),
                        new: "text",
                    });
                }
                Some(s) => match s.parse::<OutputStyle>() {
                    Ok(style) => config.default_output_format = style,
                    Err(_) => issues.push(invalid(&key, "markdown, html or text", &value)),
                },
                None => issues.push(invalid(&key, "markdown, html or text", &value)),
            },
            keys::DEFAULT_CONVERT_TO => match &value {
                Value::Null => config.default_convert_to = None,
                Value::String(s) => match s.parse::<ConvertTarget>() {
                    Ok(target) => {
                        if s.trim().eq_ignore_ascii_case(LEGACY_JPEG) {
                            issues.push(ConfigIssue::LegacyValue {
                                key: keys::DEFAULT_CONVERT_TO,
                                old: s.clone(),
                                new: target.extension(),
                            });
                        }
                        config.default_convert_to = Some(target);
                    }
                    Err(_) => issues.push(invalid(&key, "png, jpg, webp, gif or null", &value)),
                },
                other => issues.push(invalid(&key, "png, jpg, webp, gif or null", other)),
            },
            keys::MAX_FILE_SIZE_MB | keys::MAX_TOTAL_SIZE_MB => {
                let parsed = match value {
                    Value::Null => None,
                    Value::Number(n) => Some(n),
                    other => {
                        issues.push(invalid(&key, "a number or null", &other));
                        continue;
                    }
                };
                if key == keys::MAX_FILE_SIZE_MB {
                    config.max_file_size_mb = parsed;
                } else {
                    config.max_total_size_mb = parsed;
                }
            }
            _ => {
                issues.push(ConfigIssue::UnknownKey(key.clone()));
                config.extra.insert(key, value);
            }
        }
    }
    (config, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{HARD_MAX_FILE_BYTES, HARD_MAX_TOTAL_BYTES};
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> ConfigStore {
        ConfigStore::new(tmp.path().join("wslshot").join("config.json"))
    }

    fn write_raw(store: &ConfigStore, contents: &str) {
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), contents).unwrap();
        set_owner_only(store.path());
    }

    fn set_owner_only(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    // =========================================================================
    // Defaults and serialization
    // =========================================================================

    #[test]
    fn missing_file_gives_defaults_without_writing() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config, Config::default());
        assert!(loaded.issues.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn serialized_layout() {
        let text = String::from_utf8(Config::default().to_json().unwrap()).unwrap();
        assert_eq!(
            text,
            "{\n    \"default_source\": \"\",\n    \"default_destination\": \"\",\n    \
             \"auto_stage_enabled\": false,\n    \"default_output_format\": \"markdown\",\n    \
             \"default_convert_to\": null,\n    \"max_file_size_mb\": null,\n    \
             \"max_total_size_mb\": null\n}\n"
        );
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut config = Config::default();
        config.default_source = "/mnt/c/Users/me/Pictures/Screenshots".into();
        config.auto_stage_enabled = true;
        config.default_output_format = OutputStyle::Html;
        config.default_convert_to = Some(ConvertTarget::Webp);
        config.max_file_size_mb = Some(Number::from(25));
        config.max_total_size_mb = Number::from_f64(100.5);
        config.extra.insert("future_option".into(), json!({"nested": [1, 2]}));

        store.save(&config, false).unwrap();
        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config, config);
    }

    #[test]
    fn save_of_load_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut config = Config::default();
        config.default_destination = "/home/me/notes/img".into();
        config.max_file_size_mb = Some(Number::from(10));
        config.extra.insert("zzz".into(), json!("kept"));
        store.save(&config, false).unwrap();
        let first = fs::read(store.path()).unwrap();

        let loaded = store.load(false).unwrap();
        store.save(&loaded.config, false).unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.save(&Config::default(), false).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn invalid_keys_reset_individually() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(
            &store,
            r#"{
                "default_source": 42,
                "default_destination": "/keep/me",
                "auto_stage_enabled": "yes",
                "default_output_format": "pdf",
                "default_convert_to": "bmp",
                "max_file_size_mb": "huge",
                "max_total_size_mb": 150
            }"#,
        );

        let loaded = store.load(false).unwrap();
        let config = loaded.config;
        assert_eq!(config.default_source, "");
        assert_eq!(config.default_destination, "/keep/me");
        assert!(!config.auto_stage_enabled);
        assert_eq!(config.default_output_format, OutputStyle::Markdown);
        assert_eq!(config.default_convert_to, None);
        assert_eq!(config.max_file_size_mb, None);
        assert_eq!(config.max_total_size_mb, Some(Number::from(150)));

        let invalid: Vec<_> = loaded
            .issues
            .iter()
            .filter(|i| matches!(i, ConfigIssue::InvalidKey { .. }))
            .collect();
        assert_eq!(invalid.len(), 5);
        // The file itself is untouched.
        assert!(store.path().exists());
    }

    #[test]
    fn unknown_keys_are_kept_and_flagged() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, r#"{"theme": "dark", "default_source": "/src"}"#);

        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config.extra.get("theme"), Some(&json!("dark")));
        assert!(loaded
            .issues
            .contains(&ConfigIssue::UnknownKey("theme".into())));

        store.save(&loaded.config, false).unwrap();
        assert_eq!(read_json(store.path())["theme"], json!("dark"));
    }

    #[test]
    fn interleaved_unknown_keys_keep_their_position() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(
            &store,
            r#"{"default_source": "/src", "theme": "dark", "auto_stage_enabled": true, "zz_last": 1}"#,
        );

        let loaded = store.load(false).unwrap();
        store.save(&loaded.config, false).unwrap();

        let saved = read_json(store.path());
        let keys: Vec<&str> = saved.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "default_source",
                "theme",
                "auto_stage_enabled",
                "zz_last",
                "default_destination",
                "default_output_format",
                "default_convert_to",
                "max_file_size_mb",
                "max_total_size_mb",
            ]
        );
        assert_eq!(saved["auto_stage_enabled"], json!(true));
    }

    #[test]
    fn legacy_values_are_understood_but_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(
            &store,
            r#"{"default_output_format": "Plain_Text", "default_convert_to": "JPEG"}"#,
        );

        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config.default_output_format, OutputStyle::Text);
        assert_eq!(loaded.config.default_convert_to, Some(ConvertTarget::Jpg));
        assert_eq!(
            loaded
                .issues
                .iter()
                .filter(|i| matches!(i, ConfigIssue::LegacyValue { .. }))
                .count(),
            2
        );
        assert_eq!(
            read_json(store.path())["default_output_format"],
            json!("Plain_Text")
        );
    }

    #[test]
    fn legacy_key_name_is_understood() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, r#"{"output_style": "html"}"#);
        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config.default_output_format, OutputStyle::Html);
        assert!(loaded.config.extra.is_empty());
        assert!(loaded.issues.iter().any(|i| matches!(i, ConfigIssue::LegacyKey { .. })));
    }

    #[test]
    fn limits_are_clamped_on_use() {
        let mut config = Config::default();
        config.max_file_size_mb = Some(Number::from(999_999));
        config.max_total_size_mb = Some(Number::from(-1));
        let limits = config.limits();
        assert_eq!(limits.per_file(), HARD_MAX_FILE_BYTES);
        assert_eq!(limits.aggregate(), HARD_MAX_TOTAL_BYTES);
    }

    #[cfg(unix)]
    #[test]
    fn group_readable_file_is_flagged() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, "{}");
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o644)).unwrap();
        let loaded = store.load(false).unwrap();
        assert!(loaded
            .issues
            .contains(&ConfigIssue::InsecurePermissions { mode: 0o644 }));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real.json");
        fs::write(&real, "{}").unwrap();
        let link = tmp.path().join("config.json");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = ConfigStore::new(&link).load(false).unwrap_err();
        assert!(matches!(err, ConfigError::Path(PathError::SymlinkRejected(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_parent_directory_needs_the_override() {
        let tmp = TempDir::new().unwrap();
        let real_home = tmp.path().join("data").join("home");
        fs::create_dir_all(real_home.join(".config").join("wslshot")).unwrap();
        let home = tmp.path().join("home");
        std::os::unix::fs::symlink(&real_home, &home).unwrap();
        let store = ConfigStore::new(home.join(".config").join("wslshot").join("config.json"));

        let err = store.load(false).unwrap_err();
        assert!(matches!(err, ConfigError::Path(PathError::SymlinkInPath(_))));
        assert!(store.save(&Config::default(), false).is_err());

        let mut config = Config::default();
        config.auto_stage_enabled = true;
        store.save(&config, true).unwrap();
        assert_eq!(store.load(true).unwrap().config, config);
        assert_eq!(store.load_read_only(true).unwrap().config, config);
        assert!(real_home.join(".config/wslshot/config.json").is_file());
    }

    // =========================================================================
    // Corruption
    // =========================================================================

    #[test]
    fn corrupted_file_is_backed_up_and_defaults_returned() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, "{not json");

        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config, Config::default());
        let backup = match &loaded.issues[..] {
            [ConfigIssue::Corrupted {
                backup: Some(backup),
                ..
            }] => backup.clone(),
            other => panic!("unexpected issues: {other:?}"),
        };
        assert!(!store.path().exists());
        assert_eq!(fs::read_to_string(&backup).unwrap(), "{not json");
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("config.json.corrupt."));
    }

    #[cfg(unix)]
    #[test]
    fn corrupted_file_that_cannot_be_moved_still_loads() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, "{not json");
        let dir = store.path().parent().unwrap().to_path_buf();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::write(dir.join("write-check"), b"").is_ok() {
            // Permissions are not enforced for this user (root); the rename
            // cannot be made to fail this way.
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let loaded = store.load(false);
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        let loaded = loaded.unwrap();
        assert_eq!(loaded.config, Config::default());
        assert!(matches!(
            &loaded.issues[..],
            [ConfigIssue::Corrupted { backup: None, .. }]
        ));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{not json");
    }

    #[test]
    fn non_object_json_is_corruption() {
        for contents in ["[1, 2, 3]", "\"markdown\"", "null", "42"] {
            let tmp = TempDir::new().unwrap();
            let store = store_in(&tmp);
            write_raw(&store, contents);
            let loaded = store.load(false).unwrap();
            assert!(matches!(
                loaded.issues.last(),
                Some(ConfigIssue::Corrupted { backup: Some(_), .. })
            ));
        }
    }

    #[test]
    fn read_only_load_never_touches_disk() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, "{not json");
        let dir = store.path().parent().unwrap().to_path_buf();
        let before: Vec<_> = fs::read_dir(&dir).unwrap().map(|e| e.unwrap().file_name()).collect();

        let loaded = store.load_read_only(false).unwrap();
        assert_eq!(loaded.config, Config::default());
        assert!(matches!(
            loaded.issues.last(),
            Some(ConfigIssue::Corrupted { backup: None, .. })
        ));
        let after: Vec<_> = fs::read_dir(&dir).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(before, after);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{not json");
    }

    #[test]
    fn interrupted_save_leaves_previous_config() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut original = Config::default();
        original.default_source = "/original".into();
        store.save(&original, false).unwrap();

        // A crash between writing the temp file and renaming it leaves the
        // partial temp file behind and the target untouched.
        let mut replacement = Config::default();
        replacement.default_source = "/replacement".into();
        let full = replacement.to_json().unwrap();
        let dir = store.path().parent().unwrap();
        fs::write(dir.join(".wslshot-crash.tmp"), &full[..full.len() / 2]).unwrap();

        let loaded = store.load(false).unwrap();
        assert_eq!(loaded.config, original);
        assert!(loaded.issues.is_empty());
    }

    // =========================================================================
    // Updates
    // =========================================================================

    #[test]
    fn apply_update_persists_changes() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let source = tmp.path().join("shots");
        fs::create_dir(&source).unwrap();

        let update = ConfigUpdate {
            source: Some(source.clone()),
            auto_stage_enabled: Some(true),
            output_style: Some(OutputStyle::Text),
            convert_to: Some(Some(ConvertTarget::Png)),
            max_file_size_mb: Some(20.0),
            max_total_size_mb: Some(75.5),
            ..ConfigUpdate::default()
        };
        let config = store.apply(&update, false).unwrap();
        assert_eq!(
            config.default_source,
            fs::canonicalize(&source).unwrap().to_string_lossy()
        );

        let on_disk = read_json(store.path());
        assert_eq!(on_disk["auto_stage_enabled"], json!(true));
        assert_eq!(on_disk["default_output_format"], json!("text"));
        assert_eq!(on_disk["default_convert_to"], json!("png"));
        assert_eq!(on_disk["max_file_size_mb"], json!(20));
        assert_eq!(on_disk["max_total_size_mb"], json!(75.5));

        let cleared = store
            .apply(
                &ConfigUpdate {
                    convert_to: Some(None),
                    ..ConfigUpdate::default()
                },
                false,
            )
            .unwrap();
        assert_eq!(cleared.default_convert_to, None);
        assert!(cleared.auto_stage_enabled);
    }

    #[test]
    fn apply_rejects_missing_source_and_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let update = ConfigUpdate {
            source: Some(tmp.path().join("does-not-exist")),
            ..ConfigUpdate::default()
        };
        assert!(matches!(
            store.apply(&update, false),
            Err(ConfigError::Path(PathError::NotFound(_)))
        ));
        assert!(!store.path().exists());
    }

    // =========================================================================
    // Migration
    // =========================================================================

    #[test]
    fn migrate_rewrites_plain_text() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, r#"{"default_output_format": "plain_text"}"#);

        let report = store.migrate(false, false).unwrap();
        assert!(report.applied);
        assert_eq!(
            report.changes,
            vec!["default_output_format: 'plain_text' → 'text'"]
        );
        assert_eq!(read_json(store.path())["default_output_format"], json!("text"));
    }

    #[test]
    fn migrate_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(&store, r#"{"default_output_format": "Plain_Text"}"#);
        let report = store.migrate(false, false).unwrap();
        assert_eq!(
            report.changes,
            vec!["default_output_format: 'plain_text' → 'text'"]
        );
    }

    #[test]
    fn migrate_dry_run_leaves_file() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let original = r#"{"default_output_format": "plain_text", "default_convert_to": "jpeg"}"#;
        write_raw(&store, original);

        let report = store.migrate(true, false).unwrap();
        assert!(!report.applied);
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.preview["default_output_format"], json!("text"));
        assert_eq!(report.preview["default_convert_to"], json!("jpg"));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), original);
    }

    #[test]
    fn migrate_renames_legacy_key_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        write_raw(
            &store,
            r#"{"default_source": "/a", "output_style": "plain_text", "extra": 1}"#,
        );

        let report = store.migrate(false, false).unwrap();
        assert_eq!(
            report.changes,
            vec![
                "output_style → default_output_format".to_string(),
                "default_output_format: 'plain_text' → 'text'".to_string(),
            ]
        );
        let keys: Vec<_> = report.preview.keys().cloned().collect();
        assert_eq!(keys, ["default_source", "default_output_format", "extra"]);
    }

    #[test]
    fn migrate_without_changes_does_not_write() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let original = r#"{"default_output_format": "text"}"#;
        write_raw(&store, original);
        let report = store.migrate(false, false).unwrap();
        assert!(!report.applied);
        assert!(report.changes.is_empty());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), original);
    }

    #[test]
    fn migrate_errors() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let err = store.migrate(false, false).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
        assert!(err.to_string().starts_with("No config file found"));

        write_raw(&store, "{invalid json");
        let err = store.migrate(false, false).unwrap_err();
        assert!(err.to_string().starts_with("Cannot read config"));

        write_raw(&store, "[\"not\", \"an\", \"object\"]");
        let err = store.migrate(false, false).unwrap_err();
        assert!(err.to_string().starts_with("Invalid config format"));
    }
}
