//! Loads and validates the daemon's configuration: a TOML config loaded via
//! the `config` crate plus env-var overrides, validated at startup.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::convert::{self, RuntimeConfig};
use crate::error::ConfigLoadError;
use crate::schema::RawConfig;
use crate::warnings::ConfigWarnings;

const ENV_PREFIX: &str = "SIFTMAIL";

/// The outcome of a successful [`ConfigLoader::load`]: the validated runtime
/// configuration plus the path it was read from, if any (a missing file
/// falls back to defaults plus environment overrides).
pub struct ConfigLoad {
    pub config: RuntimeConfig,
    pub warnings: ConfigWarnings,
    pub source_path: Option<PathBuf>,
}

/// Builds a [`RuntimeConfig`] from an optional TOML file plus
/// `SIFTMAIL__*`-prefixed environment variable overrides (double underscore
/// separates nested keys, e.g. `SIFTMAIL__FUZZY__EXPIRE_SECS`).
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { path: None }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn load(self) -> Result<ConfigLoad, ConfigLoadError> {
        let mut builder = config::Config::builder();

        let source_path = self.path.clone().or_else(default_config_path);
        if let Some(path) = &source_path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path.as_path()).required(false));
                info!(path = %path.display(), "loading configuration file");
            } else if self.path.is_some() {
                // An explicitly-named file that doesn't exist is a hard error;
                // a guessed default path silently falling through to
                // defaults-plus-env is fine.
                return Err(ConfigLoadError::Io {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
                });
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        let (config, warnings) = convert::validate(raw)?;
        warnings.log_all();

        Ok(ConfigLoad { config, warnings, source_path })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn default_config_path() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &["siftmail.toml", "config/siftmail.toml", "/etc/siftmail/siftmail.toml"];
    CANDIDATES.iter().map(Path::new).find(|p| p.exists()).map(Path::to_path_buf)
}
