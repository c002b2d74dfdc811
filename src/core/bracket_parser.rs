// src/core/bracket_parser.rs

//! # Bracket Grammar Parser
//!
//! The alternate surface syntax, closer to classic visual-novel markup:
//!
//! ```text
//! ; comment
//! *start
//! |m1|Chapter one
//! Hello[l] world.[p]
//! [bg file="room.png" time=500 fade]
//! ```
//!
//! Structural lines (`;`, `*`, `|`, `---`) are classified per line like the line
//! grammar. Everything else is read through a character cursor that interleaves
//! literal text with `[name key=value ...]` commands. The output follows exactly the
//! same tag contract as [`ScriptParser`](crate::core::line_parser::ScriptParser).

use crate::{
    constants::{BODY_KEY, TAG_LABEL, TAG_LINE_BREAK},
    core::{
        frontend::{ParseError, ScriptFrontend, stop_tag},
        line_parser::{char_tag, save_mark_tag, script_tag},
    },
    models::{Grammar, Tag, TagValues},
};
use serde_json::{Number, Value};

const BLOCK_DELIMITER: &str = "---";

/// Front-end for the `[cmd key=value]` grammar.
#[derive(Debug, Default, Clone, Copy)]
pub struct BracketParser;

impl BracketParser {
    /// Creates the bracket-grammar front-end.
    pub fn new() -> Self {
        Self
    }
}

impl ScriptFrontend for BracketParser {
    fn grammar(&self) -> Grammar {
        Grammar::Bracket
    }

    fn parse(&self, source: &str) -> Result<Vec<Tag>, ParseError> {
        let lines: Vec<&str> = source
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();
        let last_index = lines.len().saturating_sub(1);
        let mut tags = Vec::new();
        let mut save_mark_count = 0;
        let mut index = 0;

        while let Some(raw) = lines.get(index).copied() {
            let line = index + 1;
            let trimmed = raw.trim();

            if trimmed.is_empty() {
                if index != last_index {
                    tags.push(Tag::with_body(TAG_LINE_BREAK, "", line));
                }
            } else if trimmed.starts_with(';') {
                // Comment.
            } else if let Some(name) = trimmed.strip_prefix('*') {
                let name = name.trim();
                if name.is_empty() {
                    return Err(ParseError::syntax(line, "Label is missing a name."));
                }
                tags.push(Tag::with_body(TAG_LABEL, name, line));
            } else if let Some(body) = trimmed.strip_prefix('|') {
                tags.push(save_mark_tag(body.trim(), line, &mut save_mark_count));
            } else if trimmed == BLOCK_DELIMITER {
                let start = index;
                let mut body_lines = Vec::new();
                loop {
                    index += 1;
                    let next = lines.get(index).ok_or_else(|| {
                        ParseError::syntax(start + 1, "Script block opened with '---' is never closed.")
                    })?;
                    if next.trim() == BLOCK_DELIMITER {
                        break;
                    }
                    body_lines.push(*next);
                }
                tags.push(script_tag(body_lines.join("\n"), false, start + 1));
            } else {
                parse_text_line(raw, line, &mut tags)?;
            }
            index += 1;
        }

        tags.push(stop_tag(lines.len()));
        Ok(tags)
    }
}

// --- CHARACTER CURSOR ---

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Cursor {
    fn new(text: &str, line: usize) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn slice(&self, from: usize, to: usize) -> String {
        self.chars.get(from..to).map(|s| s.iter().collect()).unwrap_or_default()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::syntax(self.line, message)
    }
}

/// Reads a line mixing literal characters with bracketed commands.
fn parse_text_line(raw: &str, line: usize, tags: &mut Vec<Tag>) -> Result<(), ParseError> {
    let mut cursor = Cursor::new(raw, line);
    let mut emitted_text = false;

    while let Some(ch) = cursor.peek() {
        if ch == '[' && cursor.peek_at(1) == Some('[') {
            cursor.pos += 2;
            tags.push(char_tag('[', line));
            emitted_text = true;
        } else if ch == '[' {
            cursor.pos += 1;
            tags.push(parse_command(&mut cursor)?);
        } else {
            cursor.pos += 1;
            tags.push(char_tag(ch, line));
            emitted_text = true;
        }
    }

    if emitted_text {
        tags.push(Tag::with_body(TAG_LINE_BREAK, "", line));
    }
    Ok(())
}

/// Parses `name key=value ...]`; the cursor sits just after the opening bracket.
fn parse_command(cursor: &mut Cursor) -> Result<Tag, ParseError> {
    let body_start = cursor.pos;
    cursor.skip_whitespace();
    let name = read_word(cursor);
    if name.is_empty() {
        return Err(cursor.error("Command is missing a tag name."));
    }

    let mut values = TagValues::new();
    loop {
        cursor.skip_whitespace();
        match cursor.peek() {
            None => {
                return Err(cursor.error(format!("Unterminated '[' for command '{}'.", name)));
            }
            Some(']') => {
                let body = cursor.slice(body_start, cursor.pos);
                cursor.pos += 1;
                values.insert(BODY_KEY.to_string(), Value::String(body.trim().to_string()));
                return Ok(Tag::new(name, values, cursor.line));
            }
            Some(_) => {
                let key = read_word(cursor);
                if key.is_empty() {
                    return Err(cursor.error(format!(
                        "Unexpected character in command '{}'.",
                        name
                    )));
                }
                cursor.skip_whitespace();
                let value = if cursor.peek() == Some('=') {
                    cursor.pos += 1;
                    cursor.skip_whitespace();
                    read_value(cursor)?
                } else {
                    Value::Bool(true)
                };
                values.insert(key, value);
            }
        }
    }
}

fn read_word(cursor: &mut Cursor) -> String {
    let start = cursor.pos;
    while cursor
        .peek()
        .is_some_and(|c| !c.is_whitespace() && !matches!(c, '=' | ']' | '[' | '"' | '\''))
    {
        cursor.pos += 1;
    }
    cursor.slice(start, cursor.pos)
}

fn read_value(cursor: &mut Cursor) -> Result<Value, ParseError> {
    match cursor.peek() {
        Some(quote @ ('"' | '\'')) => {
            cursor.pos += 1;
            let mut text = String::new();
            loop {
                match cursor.bump() {
                    None => return Err(cursor.error("Unterminated quoted value.")),
                    Some('\\') => match cursor.bump() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some(other) => text.push(other),
                        None => return Err(cursor.error("Unterminated quoted value.")),
                    },
                    Some(c) if c == quote => return Ok(Value::String(text)),
                    Some(c) => text.push(c),
                }
            }
        }
        _ => {
            let start = cursor.pos;
            while cursor.peek().is_some_and(|c| !c.is_whitespace() && c != ']') {
                cursor.pos += 1;
            }
            Ok(typed_value(&cursor.slice(start, cursor.pos)))
        }
    }
}

/// Unquoted values are typed: integers, floats and keywords become JSON scalars.
fn typed_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Some(n) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{TAG_CH, TAG_JS, TAG_SAVE_MARK, TAG_STOP};
    use serde_json::json;

    fn parse(source: &str) -> Result<Vec<Tag>, ParseError> {
        BracketParser::new().parse(source)
    }

    fn names(tags: &[Tag]) -> Vec<&str> {
        tags.iter().map(Tag::name).collect()
    }

    #[test]
    fn test_typed_and_quoted_attributes() {
        let tags = parse("[bg file=\"room a.png\" time=500 alpha=0.5 fade visible=false src=x.png]")
            .unwrap();
        assert_eq!(names(&tags), vec!["bg", TAG_STOP]);
        let bg = &tags[0];
        assert_eq!(bg.str_value("file"), Some("room a.png"));
        assert_eq!(bg.value("time"), Some(&json!(500)));
        assert_eq!(bg.value("alpha"), Some(&json!(0.5)));
        assert_eq!(bg.value("fade"), Some(&json!(true)));
        assert_eq!(bg.value("visible"), Some(&json!(false)));
        assert_eq!(bg.str_value("src"), Some("x.png"));
        assert!(bg.body().starts_with("bg file="));
    }

    #[test]
    fn test_text_interleaved_with_commands() {
        let tags = parse("Hi[l]!").unwrap();
        assert_eq!(
            names(&tags),
            vec![TAG_CH, TAG_CH, "l", TAG_CH, TAG_LINE_BREAK, TAG_STOP]
        );
        assert_eq!(tags[3].str_value("text"), Some("!"));
    }

    #[test]
    fn test_command_only_line_has_no_line_break() {
        let tags = parse("[cm]\n[wait time=10]\n").unwrap();
        assert_eq!(names(&tags), vec!["cm", "wait", TAG_STOP]);
        assert_eq!(tags[1].line(), 2);
    }

    #[test]
    fn test_escaped_bracket_is_literal_text() {
        let tags = parse("[[x").unwrap();
        assert_eq!(names(&tags), vec![TAG_CH, TAG_CH, TAG_LINE_BREAK, TAG_STOP]);
        assert_eq!(tags[0].str_value("text"), Some("["));
    }

    #[test]
    fn test_structural_lines() {
        let tags = parse("; comment\n*top\n|m1|first\n|just a note\n---\ntv.a = 1\n---").unwrap();
        assert_eq!(
            names(&tags),
            vec![TAG_LABEL, TAG_SAVE_MARK, TAG_SAVE_MARK, TAG_JS, TAG_STOP]
        );
        assert_eq!(tags[0].body(), "top");
        assert_eq!(tags[1].str_value("name"), Some("m1"));
        assert_eq!(tags[2].str_value("name"), Some("__save_mark_0__"));
        assert_eq!(tags[2].str_value("comment"), Some("just a note"));
        assert_eq!(tags[3].body(), "tv.a = 1");
        assert_eq!(tags[3].line(), 5);
    }

    #[test]
    fn test_unterminated_bracket_and_quote_are_syntax_errors() {
        assert_eq!(parse("ok\n[bg file=a").unwrap_err().line(), 2);
        assert_eq!(parse("[bg file=\"a]").unwrap_err().line(), 1);
        assert_eq!(parse("[]").unwrap_err().line(), 1);
        assert_eq!(parse("*").unwrap_err().line(), 1);
        assert_eq!(parse("---\nx\n").unwrap_err().line(), 1);
    }

    #[test]
    fn test_blank_lines_and_empty_input() {
        assert_eq!(names(&parse("").unwrap()), vec![TAG_STOP]);
        let tags = parse("a\n\nb").unwrap();
        assert_eq!(
            names(&tags),
            vec![TAG_CH, TAG_LINE_BREAK, TAG_LINE_BREAK, TAG_CH, TAG_LINE_BREAK, TAG_STOP]
        );
    }
}
