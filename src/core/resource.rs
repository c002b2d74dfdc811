// src/core/resource.rs

//! # Resource Manager
//!
//! Owns everything loaded from the scripts directory: parsed scripts (kept in memory
//! and handed out as fresh cursors), the on-disk tag cache and the macro registry.
//!
//! Parsing is pure and thread-safe, so [`ResourceManager::preload_all`] parses a whole
//! directory in parallel with `rayon`. The parsed `Script`s themselves are
//! single-threaded and are only built back on the calling thread.

use crate::{
    constants::SCRIPT_EXTENSIONS,
    core::{
        async_task::{AsyncCallbacks, AsyncTask, AsyncTaskError, EventLoop, Fault},
        cache::{TagCache, cache_key},
        expression::ExpressionEvaluator,
        frontend::{ParseError, grammar_for_path, parse_source},
        macros::{Macro, MacroRegistry, MacroTable},
        script::Script,
    },
    models::{Grammar, ResolvedConfig, Tag, TagValues},
};
use rayon::prelude::*;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors raised while locating, reading or parsing script files.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A filesystem I/O error occurred.
    #[error("I/O error while reading script '{path}': {source}")]
    Io {
        /// Path of the script.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The script does not parse.
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        /// Path of the script.
        path: String,
        /// The underlying error.
        #[source]
        source: ParseError,
    },
    /// The scripts directory could not be scanned.
    #[error("Failed to scan '{path}': {message}")]
    Walk {
        /// Directory being scanned.
        path: String,
        /// Description of the failure.
        message: String,
    },
}

/// The thread-safe part of the manager: everything needed to turn a file into tags.
#[derive(Debug, Clone, Copy)]
struct TagLoader<'a> {
    scripts_dir: &'a Path,
    grammar: Grammar,
    evaluator: &'a dyn ExpressionEvaluator,
    cache: Option<&'a TagCache>,
}

impl TagLoader<'_> {
    fn load(&self, file: &str) -> Result<Vec<Tag>, ResourceError> {
        let path = self.scripts_dir.join(file);
        let source = fs::read_to_string(&path).map_err(|e| ResourceError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let grammar = grammar_for_path(&path, self.grammar);

        let key = cache_key(&source, grammar);
        if let Some(cache) = self.cache {
            match cache.read(&key) {
                Ok(Some(tags)) => return Ok(tags),
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring unreadable cache entry for '{}': {}", file, e),
            }
        }

        let tags = parse_source(&source, grammar, self.evaluator).map_err(|e| {
            ResourceError::Parse {
                path: file.to_string(),
                source: e,
            }
        })?;

        if let Some(cache) = self.cache
            && let Err(e) = cache.write(&key, &tags)
        {
            log::warn!("Failed to write cache entry for '{}': {}", file, e);
        }
        Ok(tags)
    }
}

/// Loads, caches and hands out scripts; also the macro registry.
#[derive(Debug)]
pub struct ResourceManager {
    scripts_dir: PathBuf,
    grammar: Grammar,
    max_macro_depth: usize,
    evaluator: Arc<dyn ExpressionEvaluator>,
    cache: Option<TagCache>,
    scripts: HashMap<String, Script>,
    macros: MacroTable,
}

impl ResourceManager {
    /// A manager reading scripts as described by `config`.
    pub fn new(config: &ResolvedConfig, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            scripts_dir: config.scripts_dir.clone(),
            grammar: config.grammar,
            max_macro_depth: config.max_macro_depth,
            evaluator,
            cache: config.cache_dir.as_ref().map(TagCache::new),
            scripts: HashMap::new(),
            macros: MacroTable::new(),
        }
    }

    /// Absolute directory scripts are loaded from.
    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// The evaluator used for `=`/`-` lines and conditions.
    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator.as_ref()
    }

    /// The tag cache, when enabled.
    pub fn cache(&self) -> Option<&TagCache> {
        self.cache.as_ref()
    }

    fn loader(&self) -> TagLoader<'_> {
        TagLoader {
            scripts_dir: &self.scripts_dir,
            grammar: self.grammar,
            evaluator: self.evaluator.as_ref(),
            cache: self.cache.as_ref(),
        }
    }

    fn insert_script(&mut self, file: &str, tags: Vec<Tag>) -> Script {
        let script = Script::new(file, tags).with_max_macro_depth(self.max_macro_depth);
        let cursor = script.new_cursor();
        self.scripts.insert(file.to_string(), script);
        cursor
    }

    /// `true` once `file` has been parsed.
    pub fn is_loaded(&self, file: &str) -> bool {
        self.scripts.contains_key(file)
    }

    /// Returns a fresh cursor over `file` (relative to the scripts directory),
    /// parsing it on first use.
    pub fn load_script(&mut self, file: &str) -> Result<Script, ResourceError> {
        if let Some(script) = self.scripts.get(file) {
            log::trace!("Script '{}' served from memory.", file);
            return Ok(script.new_cursor());
        }
        let tags = self.loader().load(file)?;
        log::debug!("Loaded script '{}' ({} tags).", file, tags.len());
        Ok(self.insert_script(file, tags))
    }

    /// Like [`ResourceManager::load_script`], but reports through callbacks that
    /// always settle on a later event-loop tick. Faults go to `fail`.
    pub fn load_script_async(&mut self, file: &str, event_loop: &EventLoop) -> AsyncCallbacks<Script> {
        let callbacks = AsyncCallbacks::new();
        let resolver = callbacks.clone();
        let outcome = self.load_script(file);
        event_loop.defer(move || match outcome {
            Ok(script) => {
                resolver.call_done(script);
            }
            Err(e) => {
                resolver.call_fail(Fault::failed(e.to_string()));
            }
        });
        callbacks
    }

    /// Loads several scripts, joined into one outcome that fails on the first fault.
    pub fn preload_async(
        &mut self,
        files: &[&str],
        event_loop: &EventLoop,
    ) -> Result<AsyncCallbacks, AsyncTaskError> {
        let mut task = AsyncTask::new(event_loop);
        for file in files {
            let loading = self.load_script_async(file, event_loop);
            task.add(move |_, _| {
                let joined = AsyncCallbacks::new();
                let (on_done, on_fail) = (joined.clone(), joined.clone());
                loading
                    .done(move |_| {
                        on_done.call_done(());
                    })
                    .fail(move |fault| {
                        on_fail.call_fail(fault.clone());
                    });
                joined
            });
        }
        task.run(&TagValues::new())
    }

    /// Lists every script file under the scripts directory as sorted relative paths
    /// using `/` separators.
    pub fn script_files(&self) -> Result<Vec<String>, ResourceError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.scripts_dir).follow_links(true) {
            let entry = entry.map_err(|e| ResourceError::Walk {
                path: self.scripts_dir.display().to_string(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            let is_script = entry.file_type().is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| SCRIPT_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)));
            if !is_script {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(&self.scripts_dir) {
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parses every script of the scripts directory in parallel and keeps the ones
    /// that parse. Returns the faults of the others, in file order.
    pub fn preload_all(&mut self) -> Result<Vec<ResourceError>, ResourceError> {
        let files = self.script_files()?;
        let pending: Vec<&String> = files
            .iter()
            .filter(|file| !self.scripts.contains_key(file.as_str()))
            .collect();
        let loader = self.loader();
        let results: Vec<(String, Result<Vec<Tag>, ResourceError>)> = pending
            .par_iter()
            .map(|file| (file.to_string(), loader.load(file)))
            .collect();

        let mut faults = Vec::new();
        let mut loaded = 0;
        for (file, result) in results {
            match result {
                Ok(tags) => {
                    self.insert_script(&file, tags);
                    loaded += 1;
                }
                Err(e) => faults.push(e),
            }
        }
        log::debug!(
            "Preloaded {} scripts from '{}' ({} failed).",
            loaded,
            self.scripts_dir.display(),
            faults.len()
        );
        Ok(faults)
    }

    // --- MACROS ---

    /// Registers a macro for every script, replacing one of the same name.
    pub fn define_macro(&mut self, definition: Macro) -> Option<Macro> {
        self.macros.define(definition)
    }

    /// Forgets a macro definition.
    pub fn remove_macro(&mut self, name: &str) -> Option<Macro> {
        self.macros.remove(name)
    }
}

impl MacroRegistry for ResourceManager {
    fn has_macro(&self, name: &str) -> bool {
        self.macros.has_macro(name)
    }

    fn get_macro(&self, name: &str) -> Option<Macro> {
        self.macros.get_macro(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TAG_STOP;
    use crate::core::expression::BasicEvaluator;
    use std::time::Instant;
    use tempfile::{TempDir, tempdir};

    fn setup(cache: bool) -> (TempDir, ResourceManager) {
        let dir = tempdir().unwrap();
        let scripts_dir = dir.path().join("scenario");
        fs::create_dir_all(scripts_dir.join("sub")).unwrap();
        fs::write(scripts_dir.join("start.pon"), "*top\nhello\n").unwrap();
        fs::write(scripts_dir.join("sub").join("side.ks"), "[cm]\n*side\n").unwrap();
        fs::write(scripts_dir.join("notes.txt"), "ignored").unwrap();

        let config = ResolvedConfig {
            scripts_dir,
            first_script: "start.pon".to_string(),
            grammar: Grammar::Line,
            max_macro_depth: 16,
            cache_dir: cache.then(|| dir.path().join("cache")),
            system_file: dir.path().join("system.json"),
        };
        let manager = ResourceManager::new(&config, Arc::new(BasicEvaluator::new()));
        (dir, manager)
    }

    #[test]
    fn test_load_script_returns_fresh_cursors() {
        let (_dir, mut manager) = setup(false);

        let mut first = manager.load_script("start.pon").unwrap();
        first.go_to_label("top").unwrap();
        let second = manager.load_script("start.pon").unwrap();

        assert!(manager.is_loaded("start.pon"));
        assert_eq!(second.tag_point(), 0);
        assert_eq!(second.tags().last().map(Tag::name), Some(TAG_STOP));
    }

    #[test]
    fn test_bracket_extension_selects_bracket_grammar() {
        let (_dir, mut manager) = setup(false);
        let script = manager.load_script("sub/side.ks").unwrap();
        assert_eq!(script.tags().first().map(Tag::name), Some("cm"));
        assert_eq!(script.labels(), vec!["side"]);
    }

    #[test]
    fn test_cache_is_written_and_reused() {
        // --- Setup ---
        let (dir, mut manager) = setup(true);

        // --- Execute ---
        let parsed = manager.load_script("start.pon").unwrap();
        let cache_files = fs::read_dir(dir.path().join("cache")).unwrap().count();
        let config = ResolvedConfig {
            scripts_dir: manager.scripts_dir().to_path_buf(),
            first_script: "start.pon".to_string(),
            grammar: Grammar::Line,
            max_macro_depth: 16,
            cache_dir: Some(dir.path().join("cache")),
            system_file: dir.path().join("system.json"),
        };
        let mut second_manager = ResourceManager::new(&config, Arc::new(BasicEvaluator::new()));
        let cached = second_manager.load_script("start.pon").unwrap();

        // --- Assert ---
        assert_eq!(cache_files, 1);
        assert_eq!(parsed.tags(), cached.tags());
    }

    #[test]
    fn test_missing_and_broken_scripts_fail() {
        let (dir, mut manager) = setup(false);
        assert!(matches!(
            manager.load_script("absent.pon"),
            Err(ResourceError::Io { .. })
        ));

        fs::write(dir.path().join("scenario").join("broken.pon"), "ok\n*\n").unwrap();
        let err = manager.load_script("broken.pon").unwrap_err();
        assert!(
            matches!(&err, ResourceError::Parse { path, source } if path == "broken.pon" && source.line() == 2),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_async_load_settles_on_a_later_tick() {
        let (_dir, mut manager) = setup(false);
        let event_loop = EventLoop::new();

        let ok = manager.load_script_async("start.pon", &event_loop);
        let missing = manager.load_script_async("absent.pon", &event_loop);
        assert!(ok.is_pending() && missing.is_pending());

        event_loop.tick(Instant::now());
        assert!(ok.is_done());
        assert!(missing.is_failed());
    }

    #[test]
    fn test_preload_async_joins_all_loads() {
        let (_dir, mut manager) = setup(false);
        let event_loop = EventLoop::new();

        let all = manager
            .preload_async(&["start.pon", "sub/side.ks"], &event_loop)
            .unwrap();
        let broken = manager
            .preload_async(&["start.pon", "absent.pon"], &event_loop)
            .unwrap();
        event_loop.tick(Instant::now());

        assert!(all.is_done());
        assert!(broken.is_failed());
    }

    #[test]
    fn test_preload_all_walks_the_directory() {
        let (dir, mut manager) = setup(false);
        fs::write(dir.path().join("scenario").join("bad.pon"), ";mes {text:\n").unwrap();

        assert_eq!(
            manager.script_files().unwrap(),
            vec!["bad.pon", "start.pon", "sub/side.ks"]
        );
        let faults = manager.preload_all().unwrap();

        assert_eq!(faults.len(), 1);
        assert!(manager.is_loaded("start.pon"));
        assert!(manager.is_loaded("sub/side.ks"));
        assert!(!manager.is_loaded("bad.pon"));
    }

    #[test]
    fn test_macro_registry_delegation() {
        let (_dir, mut manager) = setup(false);
        manager.define_macro(Macro::new("greet", vec![Tag::with_body("ch", "a", 1)], 1));
        assert!(manager.has_macro("greet"));
        assert!(manager.get_macro("greet").is_some());
        assert!(manager.remove_macro("greet").is_some());
        assert!(!manager.has_macro("greet"));
    }
}
