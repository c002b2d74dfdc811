// src/cli/handlers/parse.rs

//! `novelscript parse`: prints the tag stream of one script.

use crate::{
    constants::{BODY_KEY, RESERVED_TAG_NAMES},
    core::{
        expression::BasicEvaluator,
        frontend::{grammar_for_path, parse_source},
    },
    models::{Grammar, Tag},
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::{fs, path::PathBuf};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Parses a script file and prints its tag stream."
)]
struct ParseArgs {
    /// The script file to parse.
    file: PathBuf,

    /// Force a grammar instead of choosing one from the file extension.
    #[arg(long, short)]
    grammar: Option<Grammar>,

    /// Print the tags as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

/// Entry point of `novelscript parse`.
pub fn handle(args: Vec<String>) -> Result<()> {
    let parse_args = ParseArgs::try_parse_from(&args)?;
    let source = fs::read_to_string(&parse_args.file)
        .with_context(|| format!("Failed to read '{}'", parse_args.file.display()))?;
    let grammar = parse_args
        .grammar
        .unwrap_or_else(|| grammar_for_path(&parse_args.file, Grammar::default()));

    let tags = parse_source(&source, grammar, &BasicEvaluator::new())
        .with_context(|| format!("Failed to parse '{}'", parse_args.file.display()))?;

    if parse_args.json {
        println!("{}", serde_json::to_string_pretty(&tags)?);
    } else {
        print_table(&tags);
    }
    Ok(())
}

fn print_table(tags: &[Tag]) {
    let name_width = tags
        .iter()
        .map(|t| t.name().len())
        .max()
        .unwrap_or_default();
    for tag in tags {
        let name = format!("{:<width$}", tag.name(), width = name_width);
        let name = if RESERVED_TAG_NAMES.contains(&tag.name()) {
            name.yellow()
        } else {
            name.cyan()
        };
        println!(
            "{} {} {}",
            format!("{:>5}", tag.line()).dimmed(),
            name,
            describe_values(tag)
        );
    }
    println!("\n{} {}", tags.len().to_string().bold(), "tags".dimmed());
}

/// Renders the values without the raw body, which duplicates the source line.
fn describe_values(tag: &Tag) -> String {
    let values: Vec<String> = tag
        .values()
        .iter()
        .filter(|(key, _)| key.as_str() != BODY_KEY)
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    values.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TagValues;
    use serde_json::json;

    #[test]
    fn test_describe_values_skips_body() {
        let mut values = TagValues::new();
        values.insert("text".to_string(), json!("hi"));
        values.insert("time".to_string(), json!(3));
        let tag = Tag::new("mes", values, 4);

        let described = describe_values(&tag);
        assert!(described.contains("text=\"hi\""));
        assert!(described.contains("time=3"));
        assert!(!described.contains(BODY_KEY));
    }

    #[test]
    fn test_args_accept_grammar_names() {
        let args = ParseArgs::try_parse_from(["a.txt", "--grammar", "bracket", "--json"]).unwrap();
        assert_eq!(args.grammar, Some(Grammar::Bracket));
        assert!(args.json);
        assert!(ParseArgs::try_parse_from(["a.txt", "--grammar", "yaml"]).is_err());
    }
}
