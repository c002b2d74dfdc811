// src/core/frontend.rs

//! # Script Front-ends
//!
//! Both surface grammars translate source text into the same flat `Tag` sequence.
//! This module holds the shared contract: the [`ScriptFrontend`] trait, the
//! [`ParseError`] type and the grammar selector.

use crate::{
    constants::{BRACKET_GRAMMAR_EXTENSION, TAG_STOP},
    core::{bracket_parser::BracketParser, expression::ExpressionEvaluator, line_parser::ScriptParser},
    models::{Grammar, Tag},
};
use std::path::Path;
use thiserror::Error;

/// A parse-time fault. The whole parse is aborted; no partial tag stream is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed command, label, save-mark or block.
    #[error("Syntax error at line {line}: {message}")]
    Syntax {
        /// 1-based line where the faulty construct starts.
        line: usize,
        /// Description of the failure.
        message: String,
    },
}

impl ParseError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    /// 1-based line of the fault.
    pub fn line(&self) -> usize {
        match self {
            Self::Syntax { line, .. } => *line,
        }
    }
}

/// A grammar front-end producing the shared tag contract.
pub trait ScriptFrontend {
    /// The grammar this front-end reads.
    fn grammar(&self) -> Grammar;

    /// Parses a whole script. The result always ends with the `s` sentinel tag.
    fn parse(&self, source: &str) -> Result<Vec<Tag>, ParseError>;
}

/// Returns the front-end implementing `grammar`.
pub fn frontend_for<'e>(
    grammar: Grammar,
    evaluator: &'e dyn ExpressionEvaluator,
) -> Box<dyn ScriptFrontend + 'e> {
    match grammar {
        Grammar::Line => Box::new(ScriptParser::new(evaluator)),
        Grammar::Bracket => Box::new(BracketParser::new()),
    }
}

/// Picks the grammar for a file: `.ks` files always use the bracket grammar.
pub fn grammar_for_path(path: &Path, default: Grammar) -> Grammar {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(BRACKET_GRAMMAR_EXTENSION) => Grammar::Bracket,
        _ => default,
    }
}

/// Parses `source` with the given grammar.
pub fn parse_source(
    source: &str,
    grammar: Grammar,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Vec<Tag>, ParseError> {
    let tags = frontend_for(grammar, evaluator).parse(source)?;
    log::debug!(
        "Parsed {} tags with the {} grammar.",
        tags.len(),
        grammar
    );
    Ok(tags)
}

/// Builds the terminal sentinel placed after the last line.
pub(crate) fn stop_tag(line_count: usize) -> Tag {
    Tag::with_body(TAG_STOP, "", line_count.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::BasicEvaluator;

    #[test]
    fn test_grammar_for_path() {
        assert_eq!(
            grammar_for_path(Path::new("scenario/start.ks"), Grammar::Line),
            Grammar::Bracket
        );
        assert_eq!(
            grammar_for_path(Path::new("scenario/start.pon"), Grammar::Line),
            Grammar::Line
        );
        assert_eq!(
            grammar_for_path(Path::new("noext"), Grammar::Bracket),
            Grammar::Bracket
        );
    }

    #[test]
    fn test_both_grammars_end_with_stop_sentinel() {
        let evaluator = BasicEvaluator::new();
        for grammar in [Grammar::Line, Grammar::Bracket] {
            for source in ["", "\n\n", "hello"] {
                let tags = parse_source(source, grammar, &evaluator).unwrap();
                assert_eq!(tags.last().map(Tag::name), Some(TAG_STOP), "{grammar}: {source:?}");
            }
        }
    }

    #[test]
    fn test_grammars_agree_on_equivalent_sources() {
        let evaluator = BasicEvaluator::new();
        let line = parse_source(
            ";mes {text: \"hi\"}\n*top\n~m1|first\nab\n",
            Grammar::Line,
            &evaluator,
        )
        .unwrap();
        let bracket = parse_source(
            "[mes text=\"hi\"]\n*top\n|m1|first\nab\n",
            Grammar::Bracket,
            &evaluator,
        )
        .unwrap();

        let names = |tags: &[Tag]| tags.iter().map(|t| t.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(&line), names(&bracket));
        assert_eq!(line[0].str_value("text"), bracket[0].str_value("text"));
        assert_eq!(line[2].str_value("name"), bracket[2].str_value("name"));
    }
}
