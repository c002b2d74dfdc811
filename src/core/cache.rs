// src/core/cache.rs

//! # Compiled Tag Cache
//!
//! Parsed tag sequences are stored on disk so unchanged scripts skip parsing:
//!
//! 1. The key is the blake3 hash of the grammar name plus the source text, truncated
//!    and hex-encoded. Editing a script changes its key, so stale entries are never read.
//! 2. The payload is the tag vector encoded with `bincode` and compressed with `lz4_flex`.
//!
//! Tag values are arbitrary JSON, which `bincode` cannot describe on its own, so each
//! value map travels as a JSON string inside the binary payload.

use crate::{
    constants::CACHE_FILE_EXTENSION,
    models::{Grammar, Tag, TagValues},
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;

const HASH_TRUNCATE_LENGTH: usize = 16; // 16 bytes = 32 hex characters

/// Bumped whenever the on-disk layout changes.
const CACHE_FORMAT_VERSION: u32 = 1;

/// Errors raised while reading or writing the tag cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A filesystem I/O error occurred.
    #[error("I/O error while accessing cache file '{path}': {source}")]
    Io {
        /// Path of the cache file.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The compressed payload is corrupt.
    #[error("Failed to decompress cache file '{path}': {message}")]
    Decompress {
        /// Path of the cache file.
        path: String,
        /// What `lz4_flex` reported.
        message: String,
    },
    /// An error occurred while deserializing data from `bincode` binary format.
    #[error("Failed to decode cache data: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),
    /// An error occurred while serializing data to `bincode` binary format.
    #[error("Failed to encode cache data: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),
    /// A stored value map is not valid JSON.
    #[error("Corrupt tag values in cache: {0}")]
    Json(#[from] serde_json::Error),
    /// The file was written by an incompatible version.
    #[error("Cache file has format version {found}, expected {}", CACHE_FORMAT_VERSION)]
    Version {
        /// Version stored in the file.
        found: u32,
    },
}

#[derive(Serialize, Deserialize, Debug)]
struct CachedTag {
    name: String,
    values_json: String,
    line: usize,
}

#[derive(Serialize, Deserialize, Debug)]
struct CachedScript {
    version: u32,
    tags: Vec<CachedTag>,
}

/// Computes the cache key of a script source parsed with `grammar`.
pub fn cache_key(source: &str, grammar: Grammar) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(grammar.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(source.as_bytes());
    let hash = hasher.finalize();
    hex::encode(hash.as_bytes().get(..HASH_TRUNCATE_LENGTH).unwrap_or_default())
}

/// A directory of compiled tag files.
#[derive(Debug, Clone)]
pub struct TagCache {
    dir: PathBuf,
}

impl TagCache {
    /// A cache rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the entry for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, CACHE_FILE_EXTENSION))
    }

    /// Reads the tags stored under `key`. A missing entry is `Ok(None)`.
    ///
    /// This function is on the hot path for "cache hit" scenarios.
    pub fn read(&self, key: &str) -> Result<Option<Vec<Tag>>, CacheError> {
        let path = self.path_for(key);
        let compressed_bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Cache miss for key {}", key);
                return Ok(None);
            }
            Err(e) => {
                return Err(CacheError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };

        debug!(
            "Decompressing cached tags from {} bytes.",
            compressed_bytes.len()
        );
        let decompressed_bytes =
            lz4_flex::decompress_size_prepended(&compressed_bytes).map_err(|e| {
                CacheError::Decompress {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
            })?;

        let (cached, _): (CachedScript, usize) =
            bincode::serde::decode_from_slice(&decompressed_bytes, bincode::config::standard())?;
        if cached.version != CACHE_FORMAT_VERSION {
            return Err(CacheError::Version {
                found: cached.version,
            });
        }

        let tags = cached
            .tags
            .into_iter()
            .map(|t| {
                let values: TagValues = serde_json::from_str(&t.values_json)?;
                Ok(Tag::new(t.name, values, t.line))
            })
            .collect::<Result<Vec<_>, CacheError>>()?;
        debug!("Cache hit for key {} ({} tags)", key, tags.len());
        Ok(Some(tags))
    }

    /// Writes `tags` under `key`, creating the cache directory when needed.
    ///
    /// This function is on the "cold path" (cache miss).
    pub fn write(&self, key: &str, tags: &[Tag]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;

        let cached = CachedScript {
            version: CACHE_FORMAT_VERSION,
            tags: tags
                .iter()
                .map(|t| {
                    Ok(CachedTag {
                        name: t.name().to_string(),
                        values_json: serde_json::to_string(t.values())?,
                        line: t.line(),
                    })
                })
                .collect::<Result<Vec<_>, CacheError>>()?,
        };

        let decompressed_bytes =
            bincode::serde::encode_to_vec(&cached, bincode::config::standard())?;
        let compressed_bytes = lz4_flex::compress_prepend_size(&decompressed_bytes);
        debug!(
            "Compressed {} tags from {} to {} bytes.",
            tags.len(),
            decompressed_bytes.len(),
            compressed_bytes.len()
        );

        let path = self.path_for(key);
        fs::write(&path, compressed_bytes).map_err(|e| CacheError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Deletes every cache file in the directory. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CacheError::Io {
                    path: self.dir.display().to_string(),
                    source: e,
                });
            }
        };
        let suffix = format!(".{}", CACHE_FILE_EXTENSION);
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.to_string_lossy().ends_with(&suffix) {
                fs::remove_file(&path).map_err(|e| CacheError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_tags() -> Vec<Tag> {
        let mut values = TagValues::new();
        values.insert("text".to_string(), json!("hello"));
        values.insert("pos".to_string(), json!({"x": 1, "y": [2.5, null]}));
        vec![Tag::new("mes", values, 1), Tag::with_body("s", "", 2)]
    }

    #[test]
    fn test_cache_key_depends_on_source_and_grammar() {
        let a = cache_key("*top\n", Grammar::Line);
        assert_eq!(a.len(), HASH_TRUNCATE_LENGTH * 2);
        assert_eq!(a, cache_key("*top\n", Grammar::Line));
        assert_ne!(a, cache_key("*top \n", Grammar::Line));
        assert_ne!(a, cache_key("*top\n", Grammar::Bracket));
    }

    #[test]
    fn test_write_then_read_preserves_json_values() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        let cache = TagCache::new(dir.path().join("nested"));
        let tags = sample_tags();

        // --- Execute ---
        cache.write("abc", &tags).unwrap();
        let restored = cache.read("abc").unwrap();

        // --- Assert ---
        assert_eq!(restored, Some(tags));
        assert!(cache.path_for("abc").exists());
    }

    #[test]
    fn test_missing_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = TagCache::new(dir.path());
        assert!(cache.read("nothing").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let dir = tempdir().unwrap();
        let cache = TagCache::new(dir.path());
        fs::write(cache.path_for("bad"), b"\x05\x00\x00\x00garbage").unwrap();
        assert!(cache.read("bad").is_err());
    }

    #[test]
    fn test_clear_removes_only_cache_files() {
        let dir = tempdir().unwrap();
        let cache = TagCache::new(dir.path());
        cache.write("one", &sample_tags()).unwrap();
        cache.write("two", &sample_tags()).unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(dir.path().join("keep.txt").exists());
    }
}
