//! Rolling file logs for the manuscript engine.
//!
//! # Responsibility
//! - Turn the `log_level`/`log_dir` part of [`EngineConfig`] into a running
//!   `flexi_logger` backend, once per process.
//! - Capture panics as a single sanitized log line.
//!
//! # Invariants
//! - Events are metadata-only (`event=… module=… status=…` with ids and
//!   counts). Titles and manuscript content never reach the log.
//! - A second init with identical settings is a no-op; any other second init
//!   is rejected with `LoggingError::AlreadyActive`.
//! - Nothing in here panics.

use crate::config::EngineConfig;
use flexi_logger::{
    Cleanup, Criterion, FileSpec, LogSpecification, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const LOG_BASENAME: &str = "manuscript";
const ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;
const KEEP_ROTATED: usize = 4;
const PANIC_LINE_LIMIT: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK: OnceCell<()> = OnceCell::new();

struct ActiveLogger {
    settings: LogSettings,
    _handle: LoggerHandle,
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub dir: PathBuf,
}

impl LogSettings {
    /// Validates a level name and an absolute directory.
    pub fn new(level: &str, dir: &str) -> Result<Self, LoggingError> {
        Ok(Self {
            level: parse_level(level)?,
            dir: absolute_dir(dir)?,
        })
    }

    /// Settings carried by `config`, or `None` when it has no `log_dir`.
    pub fn from_config(config: &EngineConfig) -> Result<Option<Self>, LoggingError> {
        let Some(dir) = config.log_dir.as_deref() else {
            return Ok(None);
        };
        let level = config.log_level.as_deref().unwrap_or(default_log_level());
        Self::new(level, dir).map(Some)
    }
}

/// Logging bootstrap failures.
#[derive(Debug)]
pub enum LoggingError {
    UnknownLevel(String),
    RelativeDir(String),
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },
    Backend(String),
    /// Logging already runs with different settings.
    AlreadyActive {
        active: LogSettings,
        requested: LogSettings,
    },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownLevel(level) => write!(
                f,
                "unknown log level `{level}`; expected trace|debug|info|warn|error"
            ),
            Self::RelativeDir(dir) => write!(f, "log_dir must be absolute, got `{dir}`"),
            Self::CreateDir { dir, source } => {
                write!(f, "cannot create log dir `{}`: {source}", dir.display())
            }
            Self::Backend(message) => write!(f, "log backend failed to start: {message}"),
            Self::AlreadyActive { active, requested } => write!(
                f,
                "logging already active ({} at `{}`); refusing {} at `{}`",
                active.level,
                active.dir.display(),
                requested.level,
                requested.dir.display()
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDir { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Starts file logging with explicit settings.
pub fn init_logging(settings: &LogSettings) -> Result<(), LoggingError> {
    let active = ACTIVE.get_or_try_init(|| start_backend(settings))?;
    if active.settings != *settings {
        return Err(LoggingError::AlreadyActive {
            active: active.settings.clone(),
            requested: settings.clone(),
        });
    }
    Ok(())
}

/// Starts file logging from engine configuration.
///
/// Returns `Ok(false)` without touching the backend when `log_dir` is unset.
pub fn init_logging_from_config(config: &EngineConfig) -> Result<bool, LoggingError> {
    match LogSettings::from_config(config)? {
        Some(settings) => init_logging(&settings).map(|()| true),
        None => Ok(false),
    }
}

/// Settings of the running backend, if any.
pub fn logging_status() -> Option<LogSettings> {
    ACTIVE.get().map(|active| active.settings.clone())
}

/// `debug` in debug builds, `info` otherwise.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start_backend(settings: &LogSettings) -> Result<ActiveLogger, LoggingError> {
    std::fs::create_dir_all(&settings.dir).map_err(|source| LoggingError::CreateDir {
        dir: settings.dir.clone(),
        source,
    })?;

    let spec = LogSpecification::builder().default(settings.level).build();
    let handle = Logger::with(spec)
        .log_to_file(
            FileSpec::default()
                .directory(settings.dir.as_path())
                .basename(LOG_BASENAME),
        )
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_ROTATED),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| LoggingError::Backend(err.to_string()))?;

    install_panic_hook();
    info!(
        "event=engine_start module=logging status=ok version={} os={} level={}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        settings.level
    );

    Ok(ActiveLogger {
        settings: settings.clone(),
        _handle: handle,
    })
}

fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    let trimmed = level.trim();
    let name = if trimmed.eq_ignore_ascii_case("warning") {
        "warn"
    } else {
        trimmed
    };
    match LevelFilter::from_str(name) {
        Ok(LevelFilter::Off) | Err(_) => Err(LoggingError::UnknownLevel(trimmed.to_string())),
        Ok(filter) => Ok(filter),
    }
}

fn absolute_dir(dir: &str) -> Result<PathBuf, LoggingError> {
    let path = Path::new(dir.trim());
    if !path.is_absolute() {
        return Err(LoggingError::RelativeDir(dir.trim().to_string()));
    }
    Ok(path.to_path_buf())
}

fn install_panic_hook() {
    if PANIC_HOOK.set(()).is_err() {
        return;
    }
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map_or_else(|| "unknown".to_string(), |at| format!("{}:{}", at.file(), at.line()));
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string payload".to_string());
        error!(
            "event=panic module=logging status=error location={location} payload={}",
            one_line(&payload, PANIC_LINE_LIMIT)
        );
        previous(info);
    }));
}

/// Panic payloads may quote manuscript text: flatten and cap it.
fn one_line(value: &str, limit: usize) -> String {
    let flat: String = value
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect();
    if flat.chars().count() <= limit {
        return flat;
    }
    let mut capped: String = flat.chars().take(limit).collect();
    capped.push_str("...");
    capped
}

#[cfg(test)]
mod tests {
    use super::{
        init_logging, init_logging_from_config, logging_status, one_line, LogSettings,
        LoggingError,
    };
    use crate::config::EngineConfig;
    use log::LevelFilter;

    #[test]
    fn settings_accept_known_levels_and_warning_alias() {
        let settings = LogSettings::new(" Warning ", "/tmp/manuscript-logs").unwrap();
        assert_eq!(settings.level, LevelFilter::Warn);
        assert_eq!(
            LogSettings::new("TRACE", "/tmp/x").unwrap().level,
            LevelFilter::Trace
        );
        assert!(matches!(
            LogSettings::new("off", "/tmp/x"),
            Err(LoggingError::UnknownLevel(_))
        ));
    }

    #[test]
    fn settings_reject_relative_dir() {
        assert!(matches!(
            LogSettings::new("info", "logs/dev"),
            Err(LoggingError::RelativeDir(_))
        ));
    }

    #[test]
    fn config_without_dir_has_no_settings() {
        let config = EngineConfig::default();
        assert_eq!(LogSettings::from_config(&config).unwrap(), None);
        assert!(init_logging_from_config(&config).is_ok_and(|started| !started));
    }

    #[test]
    fn config_level_defaults_to_build_mode() {
        let config = EngineConfig {
            log_dir: Some("/tmp/manuscript-logs".to_string()),
            ..EngineConfig::default()
        };
        let settings = LogSettings::from_config(&config).unwrap().unwrap();
        let expected = if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        assert_eq!(settings.level, expected);
    }

    #[test]
    fn one_line_flattens_and_caps() {
        assert_eq!(one_line("a\nb\rc", 10), "a b c");
        assert_eq!(one_line("abcdefgh", 3), "abc...");
    }

    #[test]
    fn init_from_config_is_idempotent_and_rejects_other_settings() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            log_level: Some("info".to_string()),
            log_dir: Some(dir.path().join("logs").to_string_lossy().into_owned()),
            ..EngineConfig::default()
        };

        assert!(init_logging_from_config(&config).unwrap());
        assert!(init_logging_from_config(&config).unwrap());

        let louder = EngineConfig {
            log_level: Some("debug".to_string()),
            ..config.clone()
        };
        assert!(matches!(
            init_logging_from_config(&louder),
            Err(LoggingError::AlreadyActive { .. })
        ));

        let moved = LogSettings::new("info", &other.path().to_string_lossy()).unwrap();
        assert!(matches!(
            init_logging(&moved),
            Err(LoggingError::AlreadyActive { .. })
        ));

        let active = logging_status().unwrap();
        assert_eq!(active.level, LevelFilter::Info);
        assert_eq!(active.dir, dir.path().join("logs"));
    }
}
