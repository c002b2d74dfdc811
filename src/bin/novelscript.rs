// src/bin/novelscript.rs

//! Entry point of the `novelscript` binary.

use anyhow::Result;
use clap::Parser;
use colored::*;
use novelscript::{
    cli::{Cli, handlers},
    system::player::PlayerError,
};

// --- Command Definition and Registry ---

/// A command, its aliases and its handler.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    summary: &'static str,
    handler: fn(Vec<String>) -> Result<()>,
}

/// Every command the binary understands. Add an entry here to add a command.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "parse",
        aliases: &["p"],
        summary: "Print the tag stream of a script file",
        handler: handlers::parse::handle,
    },
    CommandDefinition {
        name: "check",
        aliases: &[],
        summary: "Parse every script under a directory and report errors",
        handler: handlers::check::handle,
    },
    CommandDefinition {
        name: "run",
        aliases: &["play"],
        summary: "Play a script in the terminal",
        handler: handlers::run::handle,
    },
    CommandDefinition {
        name: "cache",
        aliases: &[],
        summary: "Show or clear the compiled tag cache",
        handler: handlers::cache::handle,
    },
];

/// Finds a command definition in the registry by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

fn main() {
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse()) {
        if let Some(PlayerError::Interrupted) = e.downcast_ref::<PlayerError>() {
            std::process::exit(130);
        }
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let Some(name) = cli.command else {
        print_usage();
        return Ok(());
    };

    match find_command(&name) {
        Some(command) => (command.handler)(cli.args),
        None => {
            print_usage();
            anyhow::bail!("Unknown command '{}'.", name)
        }
    }
}

fn print_usage() {
    println!("{}", "Usage: novelscript <command> [args...]".yellow().bold());
    println!();
    for command in COMMAND_REGISTRY {
        println!("  {} {}", format!("{:<8}", command.name).cyan(), command.summary);
    }
    println!("\nRun `novelscript <command> --help` for the options of a command.");
}
