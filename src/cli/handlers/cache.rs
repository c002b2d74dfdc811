// src/cli/handlers/cache.rs

//! `novelscript cache`: shows or clears the compiled tag cache.

use crate::{cli::handlers::commons, core::cache::TagCache};
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(no_binary_name = true, about = "Manages the compiled tag cache.")]
struct CacheArgs {
    #[command(subcommand)]
    action: CacheAction,

    /// Path to a `novelscript.toml`.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Prints the cache directory.
    Path,
    /// Deletes every cached tag file.
    Clear,
}

/// Entry point of `novelscript cache`.
pub fn handle(args: Vec<String>) -> Result<()> {
    let cache_args = CacheArgs::try_parse_from(&args)?;
    let config = commons::load_project_config(cache_args.config.as_deref())?;
    let Some(dir) = config.cache_dir else {
        bail!("The tag cache is disabled in the configuration.");
    };
    let cache = TagCache::new(dir);

    match cache_args.action {
        CacheAction::Path => println!("{}", cache.dir().display()),
        CacheAction::Clear => {
            let removed = cache.clear()?;
            println!(
                "{} Removed {} cached script(s) from {}",
                "✓".green(),
                removed,
                cache.dir().display().to_string().cyan()
            );
        }
    }
    Ok(())
}
