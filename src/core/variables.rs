// src/core/variables.rs

//! # Variable Namespaces
//!
//! The three namespaces scripts read and write through expressions:
//!
//! - **`tv`** (temporary): cleared whenever a save is restored.
//! - **`gv`** (game): part of every save snapshot.
//! - **`sv`** (system): persisted to disk together with the read save-marks.
//!
//! A `VarContext` is owned by the conductor and lent to the expression evaluator
//! for the duration of one evaluation. There is no global state.

use crate::models::TagValues;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

/// Errors raised while persisting or restoring the system namespace.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A filesystem I/O error occurred.
    #[error("I/O error while accessing '{path}': {source}")]
    Io {
        /// Path of the system data file.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The stored file is not valid JSON for a system snapshot.
    #[error("Failed to parse system data at '{path}': {source}")]
    Json {
        /// Path of the system data file.
        path: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Selects one of the three variable namespaces.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// `tv`: scratch values, cleared on restore.
    Tmp,
    /// `gv`: game state, saved with every snapshot.
    Game,
    /// `sv`: player-wide values persisted to disk.
    System,
}

/// The on-disk shape of the persisted system data.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
struct SystemSnapshot {
    #[serde(default)]
    vars: TagValues,
    #[serde(default)]
    read_marks: BTreeSet<String>,
}

/// Process-wide script variables, passed explicitly to whoever needs them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarContext {
    tmp: TagValues,
    game: TagValues,
    system: TagValues,
    read_marks: BTreeSet<String>,
}

impl VarContext {
    /// Creates empty namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the macro is invoked by.
    pub fn namespace(&self, namespace: Namespace) -> &TagValues {
        match namespace {
            Namespace::Tmp => &self.tmp,
            Namespace::Game => &self.game,
            Namespace::System => &self.system,
        }
    }

    /// Name the macro is invoked by.
    pub fn namespace_mut(&mut self, namespace: Namespace) -> &mut TagValues {
        match namespace {
            Namespace::Tmp => &mut self.tmp,
            Namespace::Game => &mut self.game,
            Namespace::System => &mut self.system,
        }
    }

    /// Reads a variable.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<&Value> {
        self.namespace(namespace).get(key)
    }

    /// Writes a variable, replacing any previous value.
    pub fn set(&mut self, namespace: Namespace, key: impl Into<String>, value: Value) {
        self.namespace_mut(namespace).insert(key.into(), value);
    }

    /// Empties `tv`.
    pub fn clear_tmp(&mut self) {
        self.tmp.clear();
    }

    /// Replaces the whole game namespace, as done when a save is restored.
    pub fn replace_game(&mut self, game: TagValues) {
        self.game = game;
    }

    // --- READ / UNREAD TRACKING ---

    fn mark_key(file_path: &str, mark: &str) -> String {
        format!("{}:{}", file_path, mark)
    }

    /// Records that the player has passed the given save-mark. Returns `true` the first time.
    pub fn mark_read(&mut self, file_path: &str, mark: &str) -> bool {
        self.read_marks.insert(Self::mark_key(file_path, mark))
    }

    /// `true` once the save-mark has been passed in any session.
    pub fn is_read(&self, file_path: &str, mark: &str) -> bool {
        self.read_marks.contains(&Self::mark_key(file_path, mark))
    }

    // --- PERSISTENCE ---

    /// Writes the system namespace and the read marks to `path` as JSON.
    pub fn save_system(&self, path: &Path) -> Result<(), StorageError> {
        let snapshot = SystemSnapshot {
            vars: self.system.clone(),
            read_marks: self.read_marks.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(|e| StorageError::Json {
            path: path.display().to_string(),
            source: e,
        })?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        fs::write(path, json).map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        log::debug!("System variables saved to '{}'", path.display());
        Ok(())
    }

    /// Loads the system namespace and read marks from `path`.
    /// A missing file leaves the context untouched and is not an error.
    pub fn load_system(&mut self, path: &Path) -> Result<(), StorageError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No system data at '{}', starting fresh.", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(StorageError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        let snapshot: SystemSnapshot =
            serde_json::from_str(&content).map_err(|e| StorageError::Json {
                path: path.display().to_string(),
                source: e,
            })?;
        self.system = snapshot.vars;
        self.read_marks = snapshot.read_marks;
        Ok(())
    }
}
