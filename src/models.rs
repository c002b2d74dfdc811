// src/models.rs

//! Plain data types: tags, loop frames, save data and configuration.

use crate::constants::{
    BODY_KEY, DEFAULT_FIRST_SCRIPT, DEFAULT_MAX_MACRO_DEPTH, DEFAULT_SCRIPTS_DIR,
    DEFAULT_SYSTEM_FILE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// --- TAG MODEL ---

/// Parameter map of a tag. Key order carries no meaning.
pub type TagValues = serde_json::Map<String, Value>;

/// One parsed unit of script: a command, label, save-mark, character or control directive.
///
/// Tags are immutable once built. `clone()` copies the value map, so a clone never
/// aliases the parameters of the original.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tag {
    name: String,
    values: TagValues,
    line: usize,
}

impl Tag {
    /// Builds a tag. A missing `__body__` entry is filled with an empty string.
    pub fn new(name: impl Into<String>, mut values: TagValues, line: usize) -> Self {
        values
            .entry(BODY_KEY)
            .or_insert_with(|| Value::String(String::new()));
        Self {
            name: name.into(),
            values,
            line,
        }
    }

    /// Builds a tag whose only parameter is the raw body text.
    pub fn with_body(name: impl Into<String>, body: impl Into<String>, line: usize) -> Self {
        let mut values = TagValues::new();
        values.insert(BODY_KEY.to_string(), Value::String(body.into()));
        Self::new(name, values, line)
    }

    /// Tag name, e.g. `ch`, `if` or a command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All parameters, including `__body__`.
    pub fn values(&self) -> &TagValues {
        &self.values
    }

    /// 1-based source line.
    pub fn line(&self) -> usize {
        self.line
    }

    /// The raw source text this tag was produced from.
    pub fn body(&self) -> &str {
        self.str_value(BODY_KEY).unwrap_or("")
    }

    /// Returns the raw parameter value.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the parameter as a string slice, if it is a JSON string.
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Returns a copy of this tag carrying a different value map.
    pub fn with_values(&self, values: TagValues) -> Self {
        Self::new(self.name.clone(), values, self.line)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.line)
    }
}

// --- SCRIPT STRUCTURE MODELS ---

/// The surface syntax a script file is written in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Grammar {
    /// Line-oriented grammar: `;cmd {..}`, `*label`, `~mark`, `-`, `=`, `---`.
    #[default]
    Line,
    /// Bracket grammar: `[cmd key=value]`, `*label`, `|mark`, `---`.
    Bracket,
}

impl FromStr for Grammar {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" => Ok(Self::Line),
            "bracket" => Ok(Self::Bracket),
            other => Err(format!(
                "Unknown grammar '{}' (expected 'line' or 'bracket').",
                other
            )),
        }
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => f.write_str("line"),
            Self::Bracket => f.write_str("bracket"),
        }
    }
}

/// Bookkeeping for one active `for` loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForLoopFrame {
    /// Cursor position (inside the owning frame) of the first tag of the loop body.
    pub start_point: usize,
    /// Number of macro frames that were active when the loop started.
    pub frame_depth: usize,
    /// Name of the `tv` variable that receives the iteration index.
    pub index_var: String,
    /// Iterations requested by the `for` tag.
    pub loops: u64,
    /// Iterations completed so far.
    pub count: u64,
}

/// A save-mark found in a script, as listed by `Script::save_marks`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SaveMarkInfo {
    /// Save-mark name; generated when the script leaves it out.
    pub name: String,
    /// Text after the `|`, empty when absent.
    pub comment: String,
    /// 1-based source line.
    pub line: usize,
}

/// The serialisable resume point produced at a save-mark.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SaveData {
    /// Script path, relative to the scripts directory.
    pub file_path: String,
    /// Name of the save-mark execution resumes from.
    pub save_mark: String,
    /// Snapshot of the `gv` namespace at the time of saving.
    #[serde(default)]
    pub game_vars: TagValues,
}

// --- `novelscript.toml` MODELS ---

/// Represents the deserialized structure of a `novelscript.toml` file.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// The `[engine]` table.
    #[serde(default)]
    pub engine: EngineSection,
    /// The `[cache]` table.
    #[serde(default)]
    pub cache: CacheSection,
    /// The `[storage]` table.
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[engine]`: where scripts live and how they are read.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSection {
    /// Directory holding the script files, relative to the config file.
    pub scripts_dir: PathBuf,
    /// Script played when no file is given.
    pub first_script: String,
    /// Grammar used to parse every script.
    pub grammar: Grammar,
    /// Upper bound on nested macro invocations.
    pub max_macro_depth: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
            first_script: DEFAULT_FIRST_SCRIPT.to_string(),
            grammar: Grammar::default(),
            max_macro_depth: DEFAULT_MAX_MACRO_DEPTH,
        }
    }
}

/// `[cache]`: the on-disk tag cache.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSection {
    /// Set to `false` to always parse from source.
    pub enabled: bool,
    /// Path template; `~` and environment variables are expanded.
    pub dir: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// `[storage]`: persisted player data.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSection {
    /// File holding the `sv` namespace and read marks.
    pub system_file: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            system_file: PathBuf::from(DEFAULT_SYSTEM_FILE),
        }
    }
}

/// A loaded configuration with every path made absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Absolute scripts directory.
    pub scripts_dir: PathBuf,
    /// Script played when no file is given.
    pub first_script: String,
    /// Grammar used for every script.
    pub grammar: Grammar,
    /// Upper bound on nested macro invocations.
    pub max_macro_depth: usize,
    /// `None` when caching is disabled.
    pub cache_dir: Option<PathBuf>,
    /// Absolute path of the system data file.
    pub system_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_always_carries_body() {
        let tag = Tag::new("mes", TagValues::new(), 3);
        assert_eq!(tag.body(), "");
        assert!(tag.values().contains_key(BODY_KEY));
    }

    #[test]
    fn test_tag_clone_does_not_alias_values() {
        let mut values = TagValues::new();
        values.insert("text".to_string(), json!("hello"));
        let original = Tag::new("mes", values, 1);

        let mut changed = original.values().clone();
        changed.insert("text".to_string(), json!("bye"));
        let copy = original.with_values(changed);

        assert_eq!(original.str_value("text"), Some("hello"));
        assert_eq!(copy.str_value("text"), Some("bye"));
        assert_eq!(copy.line(), 1);
    }

    #[test]
    fn test_grammar_from_str() {
        assert_eq!("Line".parse::<Grammar>(), Ok(Grammar::Line));
        assert_eq!(" bracket ".parse::<Grammar>(), Ok(Grammar::Bracket));
        assert!("xml".parse::<Grammar>().is_err());
    }

    #[test]
    fn test_config_defaults_and_unknown_fields() {
        let config: EngineConfig = toml::from_str("[engine]\ngrammar = \"bracket\"\n").unwrap();
        assert_eq!(config.engine.grammar, Grammar::Bracket);
        assert_eq!(config.engine.first_script, DEFAULT_FIRST_SCRIPT);
        assert!(config.cache.enabled);

        let result: Result<EngineConfig, _> = toml::from_str("[engine]\ngramar = \"line\"\n");
        assert!(result.is_err(), "Should fail due to unknown field 'gramar'");
    }
}
