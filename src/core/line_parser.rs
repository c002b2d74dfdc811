// src/core/line_parser.rs

//! # Line Grammar Parser
//!
//! The canonical script grammar. Every non-blank line is classified by its first
//! non-whitespace character:
//!
//! | Marker | Meaning                                         |
//! |--------|-------------------------------------------------|
//! | `#`    | comment                                         |
//! | `;`    | command with a `{...}` parameter block          |
//! | `*`    | label                                           |
//! | `~`    | save-mark (`name\|comment` or just a comment)   |
//! | `-`    | script statement, or `---` block delimiter      |
//! | `=`    | script expression whose result is printed       |
//! | other  | literal text, one `ch` tag per character        |

use crate::{
    constants::{BODY_KEY, TAG_CH, TAG_JS, TAG_LABEL, TAG_LINE_BREAK, TAG_SAVE_MARK},
    core::{
        expression::{ExpressionEvaluator, Scope},
        frontend::{ParseError, ScriptFrontend, stop_tag},
    },
    models::{Grammar, Tag, TagValues},
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    // `;name rest...` where the name runs until whitespace or the opening brace.
    static ref COMMAND_HEAD_RE: Regex = Regex::new(r"^;\s*([^\s{]+)(.*)$").unwrap();
}

/// The delimiter line opening and closing a multi-line script block.
const BLOCK_DELIMITER: &str = "---";

/// Single-pass translator from line-grammar source text into tags.
#[derive(Debug)]
pub struct ScriptParser<'e> {
    evaluator: &'e dyn ExpressionEvaluator,
}

impl<'e> ScriptParser<'e> {
    /// The evaluator is used for command parameter blocks, which are expression
    /// literals rather than JSON.
    pub fn new(evaluator: &'e dyn ExpressionEvaluator) -> Self {
        Self { evaluator }
    }
}

impl ScriptFrontend for ScriptParser<'_> {
    fn grammar(&self) -> Grammar {
        Grammar::Line
    }

    fn parse(&self, source: &str) -> Result<Vec<Tag>, ParseError> {
        let lines: Vec<&str> = source
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();
        let mut state = ParseState {
            evaluator: self.evaluator,
            lines: &lines,
            tags: Vec::new(),
            save_mark_count: 0,
        };
        state.run()?;
        let mut tags = state.tags;
        tags.push(stop_tag(lines.len()));
        Ok(tags)
    }
}

struct ParseState<'a> {
    evaluator: &'a dyn ExpressionEvaluator,
    lines: &'a [&'a str],
    tags: Vec<Tag>,
    save_mark_count: usize,
}

impl ParseState<'_> {
    fn run(&mut self) -> Result<(), ParseError> {
        let last_index = self.lines.len().saturating_sub(1);
        let mut index = 0;

        while let Some(raw) = self.lines.get(index).copied() {
            let line = index + 1;
            let trimmed = raw.trim();

            let Some(marker) = trimmed.chars().next() else {
                // Blank line: paragraph break, except for the final line of the file.
                if index != last_index {
                    self.tags.push(Tag::with_body(TAG_LINE_BREAK, "", line));
                }
                index += 1;
                continue;
            };

            match marker {
                '#' => {}
                ';' => index = self.parse_command(index)?,
                '*' => self.parse_label(trimmed, line)?,
                '~' => self.parse_save_mark(trimmed, line),
                '-' if trimmed == BLOCK_DELIMITER => index = self.parse_script_block(index)?,
                '-' => self.push_script(trimmed, line, false),
                '=' => self.push_script(trimmed, line, true),
                _ => self.parse_text(raw, line),
            }
            index += 1;
        }
        Ok(())
    }

    /// Parses a command starting at `start`. Returns the index of the last consumed line.
    fn parse_command(&mut self, start: usize) -> Result<usize, ParseError> {
        let line = start + 1;
        let first = self.lines.get(start).map(|l| l.trim()).unwrap_or_default();
        let caps = COMMAND_HEAD_RE
            .captures(first)
            .ok_or_else(|| ParseError::syntax(line, "Command is missing a tag name."))?;
        let name = caps.get(1).map_or("", |m| m.as_str());
        let mut block = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();

        // A parameter block may continue over several lines until a closing brace shows up.
        let mut end = start;
        if block.starts_with('{') && !block.contains('}') {
            loop {
                end += 1;
                let next = self.lines.get(end).ok_or_else(|| {
                    ParseError::syntax(
                        line,
                        format!("Unterminated parameter block for command '{}'.", name),
                    )
                })?;
                block.push('\n');
                block.push_str(next.trim());
                if next.contains('}') {
                    break;
                }
            }
        }

        let literal = if block.is_empty() {
            "{}".to_string()
        } else if block.starts_with('{') {
            block.clone()
        } else {
            // Brace-omission sugar: `;mes text:"hi"` means `;mes {text:"hi"}`.
            format!("{{{}}}", block)
        };

        let value = self
            .evaluator
            .evaluate(&format!("({})", literal), &mut Scope::empty())
            .map_err(|e| {
                ParseError::syntax(
                    line,
                    format!("Invalid parameter block for command '{}': {}", name, e),
                )
            })?;
        let Value::Object(mut values) = value else {
            return Err(ParseError::syntax(
                line,
                format!("Parameter block for command '{}' is not an object.", name),
            ));
        };
        values.insert(BODY_KEY.to_string(), Value::String(block));
        self.tags.push(Tag::new(name, values, line));
        Ok(end)
    }

    fn parse_label(&mut self, trimmed: &str, line: usize) -> Result<(), ParseError> {
        let name = trimmed.get(1..).unwrap_or_default().trim();
        if name.is_empty() {
            return Err(ParseError::syntax(line, "Label is missing a name."));
        }
        self.tags.push(Tag::with_body(TAG_LABEL, name, line));
        Ok(())
    }

    fn parse_save_mark(&mut self, trimmed: &str, line: usize) {
        let body = trimmed.get(1..).unwrap_or_default().trim();
        let tag = save_mark_tag(body, line, &mut self.save_mark_count);
        self.tags.push(tag);
    }

    /// Collects a `---` block. Returns the index of the closing delimiter line.
    fn parse_script_block(&mut self, start: usize) -> Result<usize, ParseError> {
        let mut body_lines = Vec::new();
        let mut end = start + 1;
        loop {
            let raw = self.lines.get(end).ok_or_else(|| {
                ParseError::syntax(start + 1, "Script block opened with '---' is never closed.")
            })?;
            if raw.trim() == BLOCK_DELIMITER {
                break;
            }
            body_lines.push(*raw);
            end += 1;
        }
        self.tags.push(script_tag(body_lines.join("\n"), false, start + 1));
        Ok(end)
    }

    fn push_script(&mut self, trimmed: &str, line: usize, print: bool) {
        let body = trimmed.get(1..).unwrap_or_default().trim();
        self.tags.push(script_tag(body.to_string(), print, line));
    }

    /// Text lines keep their whitespace: every character becomes a `ch` tag.
    fn parse_text(&mut self, raw: &str, line: usize) {
        for ch in raw.chars() {
            self.tags.push(char_tag(ch, line));
        }
        self.tags.push(Tag::with_body(TAG_LINE_BREAK, "", line));
    }
}

// --- SHARED TAG BUILDERS ---

/// Builds a `__save_mark__` tag. Without a `|` the name is generated from `counter`.
pub(crate) fn save_mark_tag(body: &str, line: usize, counter: &mut usize) -> Tag {
    let (name, comment) = match body.split_once('|') {
        Some((name, comment)) => (name.trim().to_string(), comment.trim().to_string()),
        None => {
            let name = format!("__save_mark_{}__", *counter);
            *counter += 1;
            (name, body.to_string())
        }
    };
    let mut values = TagValues::new();
    values.insert(BODY_KEY.to_string(), Value::String(body.to_string()));
    values.insert("name".to_string(), Value::String(name));
    values.insert("comment".to_string(), Value::String(comment));
    Tag::new(TAG_SAVE_MARK, values, line)
}

pub(crate) fn script_tag(body: String, print: bool, line: usize) -> Tag {
    let mut values = TagValues::new();
    values.insert(BODY_KEY.to_string(), Value::String(body));
    values.insert("print".to_string(), Value::Bool(print));
    Tag::new(TAG_JS, values, line)
}

pub(crate) fn char_tag(ch: char, line: usize) -> Tag {
    let mut values = TagValues::new();
    values.insert(BODY_KEY.to_string(), Value::String(ch.to_string()));
    values.insert("text".to_string(), Value::String(ch.to_string()));
    Tag::new(TAG_CH, values, line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TAG_STOP;
    use crate::core::expression::BasicEvaluator;
    use serde_json::json;

    fn parse(source: &str) -> Result<Vec<Tag>, ParseError> {
        ScriptParser::new(&BasicEvaluator::new()).parse(source)
    }

    fn names(tags: &[Tag]) -> Vec<&str> {
        tags.iter().map(Tag::name).collect()
    }

    #[test]
    fn test_command_label_and_text() {
        let tags = parse(";mes {text:\"hello\"}\n*label1\nあ\n").unwrap();
        assert_eq!(
            names(&tags),
            vec!["mes", TAG_LABEL, TAG_CH, TAG_LINE_BREAK, TAG_STOP]
        );
        assert_eq!(tags[0].str_value("text"), Some("hello"));
        assert_eq!(tags[0].body(), "{text:\"hello\"}");
        assert_eq!(tags[1].body(), "label1");
        assert_eq!(tags[2].str_value("text"), Some("あ"));
        assert_eq!(
            tags.iter().map(Tag::line).collect::<Vec<_>>(),
            vec![1, 2, 3, 3, 4]
        );
    }

    #[test]
    fn test_empty_input_yields_only_sentinel() {
        let tags = parse("").unwrap();
        assert_eq!(names(&tags), vec![TAG_STOP]);
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let source = ";bg {file: 'a.png', time: 100 * 2}\n*top\n~intro\nhello\n\n- tv.x = 1\n";
        assert_eq!(parse(source).unwrap(), parse(source).unwrap());
    }

    #[test]
    fn test_comments_are_skipped() {
        let tags = parse("# a comment\n   # indented comment\nx").unwrap();
        assert_eq!(names(&tags), vec![TAG_CH, TAG_LINE_BREAK, TAG_STOP]);
        assert_eq!(tags[0].line(), 3);
    }

    #[test]
    fn test_blank_lines_emit_breaks_except_the_last_line() {
        let tags = parse("a\n\n\nb\n").unwrap();
        assert_eq!(
            names(&tags),
            vec![
                TAG_CH,
                TAG_LINE_BREAK,
                TAG_LINE_BREAK,
                TAG_LINE_BREAK,
                TAG_CH,
                TAG_LINE_BREAK,
                TAG_STOP
            ]
        );
    }

    #[test]
    fn test_text_lines_keep_whitespace() {
        let tags = parse("  a b  ").unwrap();
        let text: String = tags
            .iter()
            .filter(|t| t.name() == TAG_CH)
            .filter_map(|t| t.str_value("text"))
            .collect();
        assert_eq!(text, "  a b  ");
    }

    #[test]
    fn test_brace_omission_and_expressions_in_parameters() {
        let tags = parse(";wait time: 100 + 50, skip: true\n;clear").unwrap();
        assert_eq!(tags[0].name(), "wait");
        assert_eq!(tags[0].value("time"), Some(&json!(150)));
        assert_eq!(tags[0].value("skip"), Some(&json!(true)));
        assert_eq!(tags[1].name(), "clear");
        assert_eq!(tags[1].values().len(), 1);
    }

    #[test]
    fn test_multi_line_parameter_block() {
        let tags = parse(";image {\n  file: \"bg.png\",\n  x: 10\n}\nz").unwrap();
        assert_eq!(names(&tags), vec!["image", TAG_CH, TAG_LINE_BREAK, TAG_STOP]);
        assert_eq!(tags[0].str_value("file"), Some("bg.png"));
        assert_eq!(tags[0].value("x"), Some(&json!(10)));
        assert_eq!(tags[0].line(), 1);
        assert_eq!(tags[1].line(), 5);
    }

    #[test]
    fn test_unterminated_parameter_block_is_syntax_error() {
        let err = parse("text\n;image {\n file: 'a'\n").unwrap_err();
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn test_invalid_parameter_block_reports_line() {
        let err = parse("*ok\n;mes {text: }").unwrap_err();
        assert_eq!(err.line(), 2);
        let err = parse(";mes [1, 2]").unwrap_err();
        assert_eq!(err.line(), 1);
        let err = parse(";").unwrap_err();
        assert_eq!(err.line(), 1);
    }

    #[test]
    fn test_label_requires_name() {
        let err = parse("*   \n").unwrap_err();
        assert_eq!(
            err,
            ParseError::Syntax {
                line: 1,
                message: "Label is missing a name.".to_string()
            }
        );
    }

    #[test]
    fn test_save_marks_named_and_generated() {
        let tags = parse("~chapter1|The beginning\n~ plain comment\n~another").unwrap();
        assert_eq!(tags[0].str_value("name"), Some("chapter1"));
        assert_eq!(tags[0].str_value("comment"), Some("The beginning"));
        assert_eq!(tags[1].str_value("name"), Some("__save_mark_0__"));
        assert_eq!(tags[1].str_value("comment"), Some("plain comment"));
        assert_eq!(tags[2].str_value("name"), Some("__save_mark_1__"));
    }

    #[test]
    fn test_inline_and_printed_scripts() {
        let tags = parse("- tv.a = 1\n= tv.a + 1").unwrap();
        assert_eq!(tags[0].name(), TAG_JS);
        assert_eq!(tags[0].body(), "tv.a = 1");
        assert_eq!(tags[0].value("print"), Some(&json!(false)));
        assert_eq!(tags[1].body(), "tv.a + 1");
        assert_eq!(tags[1].value("print"), Some(&json!(true)));
    }

    #[test]
    fn test_script_block_keeps_lines_verbatim() {
        let tags = parse("---\ntv.a = 1\n  tv.b = 2\n---\nx").unwrap();
        assert_eq!(names(&tags), vec![TAG_JS, TAG_CH, TAG_LINE_BREAK, TAG_STOP]);
        assert_eq!(tags[0].body(), "tv.a = 1\n  tv.b = 2");
        assert_eq!(tags[0].value("print"), Some(&json!(false)));
        assert_eq!(tags[0].line(), 1);
    }

    #[test]
    fn test_unclosed_script_block_is_syntax_error() {
        let err = parse("a\n---\ntv.a = 1\n").unwrap_err();
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn test_crlf_line_endings() {
        let tags = parse("*top\r\nab\r\n").unwrap();
        assert_eq!(tags[0].body(), "top");
        assert_eq!(names(&tags), vec![TAG_LABEL, TAG_CH, TAG_CH, TAG_LINE_BREAK, TAG_STOP]);
    }
}
