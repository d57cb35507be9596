//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/strip-proxy/config.toml`
//! 3. User config: `~/.config/strip-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! A value set in a later source overrides the earlier one.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/strip-proxy/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "strip-proxy";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config`
    /// file, invalid TOML or an invalid value is an error.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        // Start with embedded defaults
        let mut config = Config::default();
        debug!("Loaded embedded default configuration");

        // Load and merge system config
        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        // Load and merge user config
        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        // Load and merge additional config file from CLI
        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        // Apply CLI flags (highest priority)
        config.merge(Self::cli_overrides(cli));

        config.validate()?;
        Ok(config)
    }

    /// Config layer holding only the values given on the command line.
    fn cli_overrides(cli: &Cli) -> Config {
        let mut config = Config::default();
        config.listen.addr = cli.listen.map(|a| a.to_string());
        config.listen.push = cli.no_push.then_some(false);
        config.intercept.enabled = cli.no_intercept.then_some(false);
        config.ca.dir = cli.ca_dir.clone();
        config
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;
    use tempfile::tempdir;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("strip-proxy").chain(args.iter().copied()))
    }

    fn loader_in(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_paths(dir.join("system.toml"), dir.join("user.toml"))
    }

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let config = loader_in(dir.path()).load(&cli(&[])).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.listen.addr().unwrap().port(), 8087);
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[listen]\naddr = \"127.0.0.1:1000\"\n[intercept]\nrelay_idle_timeout_secs = 10\n",
        )
        .unwrap();
        fs::write(dir.path().join("user.toml"), "[listen]\naddr = \"127.0.0.1:2000\"\n").unwrap();

        let config = loader_in(dir.path()).load(&cli(&[])).unwrap();

        assert_eq!(config.listen.addr().unwrap().port(), 2000);
        assert_eq!(
            config.intercept.relay_idle_timeout(),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_cli_flags_win() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[listen]\naddr = \"127.0.0.1:2000\"\npush = true\n[ca]\ndir = \"/etc/ca\"\n",
        )
        .unwrap();

        let config = loader_in(dir.path())
            .load(&cli(&[
                "-l",
                "127.0.0.1:3000",
                "--no-push",
                "--no-intercept",
                "--ca-dir",
                "/tmp/ca",
            ]))
            .unwrap();

        assert_eq!(config.listen.addr().unwrap().port(), 3000);
        assert!(!config.listen.push());
        assert!(!config.intercept.enabled());
        assert_eq!(config.ca.dir(), Some(&PathBuf::from("/tmp/ca")));
    }

    #[test]
    fn test_absent_flags_do_not_override() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "[listen]\npush = false\n").unwrap();

        let config = loader_in(dir.path()).load(&cli(&[])).unwrap();
        assert!(!config.listen.push());
    }

    #[test]
    fn test_additional_config_file() {
        let dir = tempdir().unwrap();
        let extra = dir.path().join("extra.toml");
        fs::write(&extra, "[telemetry]\nsyslog = true\n").unwrap();

        let config = loader_in(dir.path())
            .load(&cli(&["-c", extra.to_str().unwrap()]))
            .unwrap();
        assert!(config.telemetry.syslog());
    }

    #[test]
    fn test_missing_additional_config_is_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");

        let err = loader_in(dir.path())
            .load(&cli(&["-c", missing.to_str().unwrap()]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("system.toml"), "this is not valid TOML [[[").unwrap();

        let err = loader_in(dir.path()).load(&cli(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_invalid_value_returns_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "[listen]\naddr = \"nowhere\"\n").unwrap();

        let err = loader_in(dir.path()).load(&cli(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
