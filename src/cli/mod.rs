// src/cli/mod.rs

//! Command-line front end of the `novelscript` binary.

use clap::Parser;

pub mod handlers;

/// novelscript: parse, check and play visual-novel scripts.
///
/// Commands:
///
/// - `novelscript parse <file> [--grammar line|bracket] [--json]`
/// - `novelscript check [dir] [--config PATH]`
/// - `novelscript run [file] [--label L] [--config PATH]`
/// - `novelscript cache clear [--config PATH]`
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(disable_help_subcommand = true)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// The command to run. Prints a short usage summary when omitted.
    pub command: Option<String>,

    /// Arguments forwarded to the command's own parser.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
