// src/core/macros.rs

//! # Macros
//!
//! A macro is a named slice of tags captured from a script between `macro` and
//! `endmacro`. Every call site runs its own instance: [`Macro::instantiate`] returns a
//! copy with a zeroed cursor and the caller's parameters bound, so nested or
//! recursive invocations never observe each other's position.

use crate::models::{Tag, TagValues};
use std::collections::HashMap;
use std::rc::Rc;

/// A macro definition, or one running invocation of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    name: String,
    tags: Rc<[Tag]>,
    tag_point: usize,
    params: TagValues,
    /// Line of the `macro` tag that defined it.
    line: usize,
}

impl Macro {
    /// A definition with the given body; invocations come from [`Macro::instantiate`].
    pub fn new(name: impl Into<String>, tags: Vec<Tag>, line: usize) -> Self {
        Self {
            name: name.into(),
            tags: tags.into(),
            tag_point: 0,
            params: TagValues::new(),
            line,
        }
    }

    /// Name the macro is invoked by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The macro body, without the `macro`/`endmacro` tags.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Line of the defining `macro` tag.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Parameters of the invoking tag, readable from expressions as `mp`.
    pub fn params(&self) -> &TagValues {
        &self.params
    }

    /// Returns a fresh invocation: cursor at the first body tag, `params` bound.
    pub fn instantiate(&self, params: TagValues) -> Self {
        Self {
            name: self.name.clone(),
            tags: Rc::clone(&self.tags),
            tag_point: 0,
            params,
            line: self.line,
        }
    }

    /// Returns the next body tag, or `None` once the body is exhausted.
    pub fn get_next_tag(&mut self) -> Option<Tag> {
        let tag = self.tags.get(self.tag_point)?.clone();
        self.tag_point += 1;
        Some(tag)
    }

    pub(crate) fn shared_tags(&self) -> Rc<[Tag]> {
        Rc::clone(&self.tags)
    }

    pub(crate) fn tag_point(&self) -> usize {
        self.tag_point
    }

    pub(crate) fn set_tag_point(&mut self, point: usize) {
        self.tag_point = point;
    }
}

/// Lookup interface the script cursor uses to expand macro calls.
pub trait MacroRegistry {
    /// `true` when `name` is a defined macro.
    fn has_macro(&self, name: &str) -> bool;

    /// Returns a fresh invocation of the named macro.
    fn get_macro(&self, name: &str) -> Option<Macro>;
}

/// A plain in-memory registry.
#[derive(Debug, Default, Clone)]
pub struct MacroTable {
    macros: HashMap<String, Macro>,
}

impl MacroTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a macro, replacing any previous definition with the same name.
    pub fn define(&mut self, definition: Macro) -> Option<Macro> {
        log::debug!(
            "Defining macro '{}' ({} tags).",
            definition.name(),
            definition.tags().len()
        );
        self.macros.insert(definition.name().to_string(), definition)
    }

    /// Removes a definition, returning it.
    pub fn remove(&mut self, name: &str) -> Option<Macro> {
        self.macros.remove(name)
    }

    /// Number of defined macros.
    pub fn len(&self) -> usize {
        self.macros.len()
    }

    /// `true` when no macro is defined.
    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

impl MacroRegistry for MacroTable {
    fn has_macro(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    fn get_macro(&self, name: &str) -> Option<Macro> {
        self.macros
            .get(name)
            .map(|m| m.instantiate(TagValues::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Vec<Tag> {
        vec![
            Tag::with_body("ch", "a", 2),
            Tag::with_body("ch", "b", 3),
        ]
    }

    #[test]
    fn test_instances_have_independent_cursors() {
        // --- Setup ---
        let definition = Macro::new("greet", body(), 1);
        let mut first = definition.instantiate(TagValues::new());

        // --- Execute ---
        let _ = first.get_next_tag();
        let mut second = definition.instantiate(TagValues::new());

        // --- Assert ---
        assert_eq!(second.get_next_tag().map(|t| t.body().to_string()), Some("a".into()));
        assert_eq!(first.get_next_tag().map(|t| t.body().to_string()), Some("b".into()));
        assert_eq!(first.get_next_tag(), None);
    }

    #[test]
    fn test_instantiate_binds_params() {
        let definition = Macro::new("greet", body(), 1);
        let mut params = TagValues::new();
        params.insert("who".to_string(), json!("Ann"));

        let invocation = definition.instantiate(params);

        assert_eq!(invocation.params().get("who"), Some(&json!("Ann")));
        assert!(definition.params().is_empty());
    }

    #[test]
    fn test_table_returns_fresh_invocations() {
        let mut table = MacroTable::new();
        assert!(table.define(Macro::new("greet", body(), 1)).is_none());
        assert!(table.has_macro("greet"));
        assert!(!table.has_macro("other"));

        let mut a = table.get_macro("greet").unwrap();
        let _ = a.get_next_tag();
        let b = table.get_macro("greet").unwrap();
        assert_eq!(b.tag_point(), 0);

        assert!(table.remove("greet").is_some());
        assert!(table.is_empty());
    }
}
