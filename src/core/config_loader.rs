// src/core/config_loader.rs

//! # Config Loader
//!
//! Loads `novelscript.toml` and turns it into a [`ResolvedConfig`] whose paths are
//! all absolute. Relative paths are taken relative to the directory holding the
//! config file; `~` and environment variables are expanded with `shellexpand`.
//! A missing config file is not an error: the defaults apply.

use crate::{
    constants::CONFIG_FILENAME,
    models::{EngineConfig, ResolvedConfig},
};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Errors raised while locating, reading or resolving `novelscript.toml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A filesystem I/O error occurred.
    #[error("I/O error while reading '{path}': {source}")]
    Io {
        /// Path of the configuration file.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid `novelscript.toml`.
    #[error("Invalid configuration in '{path}': {source}")]
    Toml {
        /// Path of the configuration file.
        path: String,
        /// The underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// A path template could not be expanded.
    #[error("Failed to expand path '{template}': {message}")]
    Expand {
        /// The path as written in the configuration.
        template: String,
        /// Description of the failure.
        message: String,
    },
    /// `max_macro_depth` is zero.
    #[error("'max_macro_depth' must be at least 1")]
    InvalidMacroDepth,
}

/// Walks up from `start` looking for a `novelscript.toml`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILENAME))
        .find(|candidate| candidate.is_file())
}

/// Loads the config at `path`. When the file does not exist, defaults are resolved
/// against its parent directory.
pub fn load_config(path: &Path) -> Result<ResolvedConfig, ConfigError> {
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<EngineConfig>(&content).map_err(|e| ConfigError::Toml {
            path: path.display().to_string(),
            source: e,
        })?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!(
                "No config at '{}', using defaults.",
                path.display()
            );
            EngineConfig::default()
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            });
        }
    };
    resolve_config(config, &base_dir)
}

/// Makes every path of `config` absolute relative to `base_dir`.
pub fn resolve_config(config: EngineConfig, base_dir: &Path) -> Result<ResolvedConfig, ConfigError> {
    if config.engine.max_macro_depth == 0 {
        return Err(ConfigError::InvalidMacroDepth);
    }
    let base_dir = absolute(base_dir);

    let scripts_dir = expand_path(&config.engine.scripts_dir.to_string_lossy(), &base_dir)?;
    let system_file = expand_path(&config.storage.system_file.to_string_lossy(), &base_dir)?;
    let cache_dir = if config.cache.enabled {
        Some(match &config.cache.dir {
            Some(template) => expand_path(template, &base_dir)?,
            None => default_cache_dir(&base_dir),
        })
    } else {
        None
    };

    log::debug!(
        "Resolved config: scripts='{}', cache={:?}",
        scripts_dir.display(),
        cache_dir
    );
    Ok(ResolvedConfig {
        scripts_dir,
        first_script: config.engine.first_script,
        grammar: config.engine.grammar,
        max_macro_depth: config.engine.max_macro_depth,
        cache_dir,
        system_file,
    })
}

/// Expands `~` and environment variables, then anchors relative results at `base_dir`.
pub fn expand_path(template: &str, base_dir: &Path) -> Result<PathBuf, ConfigError> {
    // `shellexpand::full` handles both home dir and env vars across platforms.
    let expanded = shellexpand::full(template).map_err(|e| ConfigError::Expand {
        template: template.to_string(),
        message: e.to_string(),
    })?;
    let path = PathBuf::from(expanded.into_owned());
    let joined = if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    };
    Ok(dunce::simplified(&joined).to_path_buf())
}

/// `~/.cache/novelscript` on Linux, the platform equivalent elsewhere.
fn default_cache_dir(base_dir: &Path) -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("novelscript"))
        .unwrap_or_else(|| base_dir.join(".novelscript-cache"))
}

fn absolute(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
