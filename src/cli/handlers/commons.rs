// src/cli/handlers/commons.rs

//! Shared helpers for the command handlers.

use crate::{
    core::config_loader::{find_config, load_config, resolve_config},
    models::{EngineConfig, ResolvedConfig},
};
use anyhow::{Context, Result};
use std::{env, path::Path};

/// Resolves the project configuration.
///
/// Priority: the explicit `--config` path, then the nearest `novelscript.toml` above
/// the current directory, then the built-in defaults relative to the current directory.
pub fn load_project_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    if let Some(path) = explicit {
        return load_config(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()));
    }

    let cwd = env::current_dir().context("Failed to read the current directory")?;
    match find_config(&cwd) {
        Some(path) => {
            log::debug!("Using config at '{}'.", path.display());
            load_config(&path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))
        }
        None => {
            log::debug!("No config found above '{}', using defaults.", cwd.display());
            Ok(resolve_config(EngineConfig::default(), &cwd)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CONFIG_FILENAME;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_explicit_config_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "[engine]\nfirst_script = \"prologue.pon\"\n").unwrap();

        let config = load_project_config(Some(path.as_path())).unwrap();
        assert_eq!(config.first_script, "prologue.pon");
    }

    #[test]
    fn test_broken_explicit_config_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "[engine\n").unwrap();

        let err = load_project_config(Some(path.as_path())).unwrap_err();
        assert!(format!("{:#}", err).contains(CONFIG_FILENAME));
    }
}
