//! Configuration management for the lock operator tool
//!
//! Sources, lowest precedence first:
//! - `conf/batata-lock.yml` (or `--config`), optional
//! - `BATATA_*` environment variables, `__` separating nested keys
//!   (e.g. `BATATA_LOCK__STORE_COUNT=5`)
//! - command line flags

use std::path::PathBuf;

use clap::Parser;
use config::{Config, Environment, File};
use tracing::Level;

use batata_common::BatataError;
use batata_lock::LockSettings;

use crate::drill::DrillParams;
use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/batata-lock.yml";

const LOCK_SETTINGS_KEY: &str = "lock";

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "batata-lockctl", version, about = "Run quorum lock contention drills")]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,
    /// Number of independent lock stores
    #[arg(long = "stores")]
    pub stores: Option<usize>,
    /// Stores that reject every call, simulating unavailable nodes
    #[arg(long = "failing-stores")]
    pub failing_stores: Option<usize>,
    /// Concurrent workers competing for the lock
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<usize>,
    /// Critical sections each worker runs
    #[arg(short = 'r', long = "rounds")]
    pub rounds: Option<usize>,
    /// Time spent inside each critical section in milliseconds
    #[arg(long = "hold-ms")]
    pub hold_ms: Option<u64>,
    /// Lock key expiration in milliseconds
    #[arg(long = "expiration-ms")]
    pub expiration_ms: Option<u64>,
    /// Log acquisition rounds and extensions at info level
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "log-level", env = "BATATA_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Application configuration loaded from file, environment and flags
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new(cli: &Cli) -> Result<Self, BatataError> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&cli.config).required(false))
            .add_source(
                Environment::with_prefix("BATATA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let overrides: [(&str, Option<config::Value>); 8] = [
            ("lock.store_count", cli.stores.map(|v| (v as i64).into())),
            ("drill.failing_stores", cli.failing_stores.map(|v| (v as i64).into())),
            ("drill.workers", cli.workers.map(|v| (v as i64).into())),
            ("drill.rounds", cli.rounds.map(|v| (v as i64).into())),
            ("drill.hold_ms", cli.hold_ms.map(|v| (v as i64).into())),
            ("lock.key_expiration_ms", cli.expiration_ms.map(|v| (v as i64).into())),
            ("lock.verbose", cli.verbose.then(|| true.into())),
            ("logging.level", cli.log_level.clone().map(Into::into)),
        ];
        for (key, value) in overrides {
            if let Some(value) = value {
                builder = builder
                    .set_override(key, value)
                    .map_err(|e| BatataError::ConfigError(e.to_string()))?;
            }
        }

        let config = builder
            .build()
            .map_err(|e| BatataError::ConfigError(e.to_string()))?;
        Ok(Configuration { config })
    }

    // ========================================================================
    // Lock Configuration
    // ========================================================================

    pub fn lock_settings(&self) -> Result<LockSettings, BatataError> {
        match self.config.get::<LockSettings>(LOCK_SETTINGS_KEY) {
            Ok(settings) => Ok(settings),
            Err(config::ConfigError::NotFound(_)) => Ok(LockSettings::default()),
            Err(e) => Err(BatataError::ConfigError(format!(
                "invalid '{}' section: {}",
                LOCK_SETTINGS_KEY, e
            ))),
        }
    }

    // ========================================================================
    // Drill Configuration
    // ========================================================================

    pub fn drill_params(&self) -> DrillParams {
        let defaults = DrillParams::default();
        DrillParams {
            lock_type: self
                .config
                .get_string("drill.lock_type")
                .unwrap_or(defaults.lock_type),
            key: self.config.get_string("drill.key").unwrap_or(defaults.key),
            workers: self
                .config
                .get_int("drill.workers")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.workers),
            rounds: self
                .config
                .get_int("drill.rounds")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.rounds),
            hold_ms: self
                .config
                .get_int("drill.hold_ms")
                .map(|v| v.max(0) as u64)
                .unwrap_or(defaults.hold_ms),
            failing_stores: self
                .config
                .get_int("drill.failing_stores")
                .map(|v| v.max(0) as usize)
                .unwrap_or(defaults.failing_stores),
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        let defaults = LoggingConfig::default();
        let level = self
            .config
            .get_string("logging.level")
            .ok()
            .and_then(|v| v.parse::<Level>().ok())
            .unwrap_or(defaults.level);
        LoggingConfig {
            level,
            console_output: self
                .config
                .get_bool("logging.console")
                .unwrap_or(defaults.console_output),
            file_logging: self
                .config
                .get_bool("logging.file")
                .unwrap_or(defaults.file_logging),
            log_dir: self
                .config
                .get_string("logging.dir")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            rotation: defaults.rotation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["batata-lockctl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_config_file() {
        let configuration =
            Configuration::new(&cli(&["--config", "/nonexistent/batata-lock.yml"])).unwrap();

        assert_eq!(configuration.lock_settings().unwrap(), LockSettings::default());
        assert_eq!(configuration.drill_params(), DrillParams::default());
        assert_eq!(configuration.logging_config().level, Level::INFO);
    }

    #[test]
    fn test_file_settings() {
        let file = write_config(
            r#"
lock:
  store_count: 5
  key_expiration_ms: 2000
  max_retries: 50
  extend_ttl_ms: 1000
drill:
  workers: 6
  rounds: 2
  hold_ms: 15
  key: nightly
logging:
  level: debug
  file: false
"#,
        );
        let path = file.path().to_string_lossy().to_string();
        let configuration = Configuration::new(&cli(&["--config", &path])).unwrap();

        let settings = configuration.lock_settings().unwrap();
        assert_eq!(settings.store_count, 5);
        assert_eq!(settings.key_expiration_ms, 2000);
        assert_eq!(settings.max_retries, 50);
        assert_eq!(settings.extend_ttl_ms, Some(1000));

        let params = configuration.drill_params();
        assert_eq!(params.workers, 6);
        assert_eq!(params.rounds, 2);
        assert_eq!(params.hold_ms, 15);
        assert_eq!(params.key, "nightly");
        assert_eq!(params.lock_type, DrillParams::default().lock_type);

        let logging = configuration.logging_config();
        assert_eq!(logging.level, Level::DEBUG);
        assert!(!logging.file_logging);
    }

    #[test]
    fn test_command_line_overrides_file() {
        let file = write_config(
            r#"
lock:
  store_count: 5
drill:
  workers: 6
"#,
        );
        let path = file.path().to_string_lossy().to_string();
        let configuration = Configuration::new(&cli(&[
            "--config",
            &path,
            "--stores",
            "7",
            "--workers",
            "3",
            "--expiration-ms",
            "500",
            "--verbose",
        ]))
        .unwrap();

        let settings = configuration.lock_settings().unwrap();
        assert_eq!(settings.store_count, 7);
        assert_eq!(settings.key_expiration_ms, 500);
        assert!(settings.verbose);
        assert_eq!(configuration.drill_params().workers, 3);
    }

    #[test]
    fn test_invalid_lock_section() {
        let file = write_config(
            r#"
lock:
  store_count: "many"
"#,
        );
        let path = file.path().to_string_lossy().to_string();
        let configuration = Configuration::new(&cli(&["--config", &path])).unwrap();
        assert!(configuration.lock_settings().is_err());
    }
}
