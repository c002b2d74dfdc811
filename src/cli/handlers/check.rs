// src/cli/handlers/check.rs

//! `novelscript check`: parses every script of a project and reports faults.

use crate::{
    cli::handlers::commons,
    core::{config_loader::expand_path, expression::BasicEvaluator, resource::ResourceManager},
};
use anyhow::{Result, bail};
use clap::Parser;
use colored::*;
use std::{env, path::PathBuf, sync::Arc};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Parses every script under a directory and reports syntax errors."
)]
struct CheckArgs {
    /// The directory to check. Defaults to the configured scripts directory.
    dir: Option<String>,

    /// Path to a `novelscript.toml`.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Entry point of `novelscript check`.
pub fn handle(args: Vec<String>) -> Result<()> {
    let check_args = CheckArgs::try_parse_from(&args)?;
    let mut config = commons::load_project_config(check_args.config.as_deref())?;
    if let Some(dir) = &check_args.dir {
        config.scripts_dir = expand_path(dir, &env::current_dir()?)?;
    }

    let mut resources = ResourceManager::new(&config, Arc::new(BasicEvaluator::new()));
    let files = resources.script_files()?;
    println!(
        "Checking {} script(s) in {}",
        files.len(),
        config.scripts_dir.display().to_string().cyan()
    );

    let faults = resources.preload_all()?;
    for fault in &faults {
        println!("  {} {}", "✗".red(), fault);
    }

    if !faults.is_empty() {
        bail!("{} of {} script(s) failed to parse.", faults.len(), files.len());
    }
    println!("{} All scripts parsed.", "✓".green());
    Ok(())
}
