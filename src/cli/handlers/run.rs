// src/cli/handlers/run.rs

//! `novelscript run`: plays a script in the terminal.

use crate::{
    cli::handlers::commons,
    core::{
        async_task::EventLoop,
        conductor::{Conductor, ConductorStatus},
        expression::BasicEvaluator,
        resource::ResourceManager,
    },
    models::ResolvedConfig,
    system::player::{self, PlayerError, TerminalPlayer},
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::{
    future,
    io::{self, Stdout},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Plays a script in the terminal.")]
struct RunArgs {
    /// The script to play, relative to the scripts directory. Defaults to `first_script`.
    file: Option<String>,

    /// Start at this label instead of the beginning of the script.
    #[arg(long, short)]
    label: Option<String>,

    /// Path to a `novelscript.toml`.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

/// Entry point of `novelscript run`.
pub fn handle(args: Vec<String>) -> Result<()> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let config = commons::load_project_config(run_args.config.as_deref())?;

    // The conductor is single-threaded, so a current-thread runtime drives it directly.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(play(config, run_args))
}

async fn play(config: ResolvedConfig, run_args: RunArgs) -> Result<()> {
    let file = run_args
        .file
        .unwrap_or_else(|| config.first_script.clone());

    let resources = ResourceManager::new(&config, Arc::new(BasicEvaluator::new()));
    let mut conductor: Conductor<TerminalPlayer<Stdout>> =
        Conductor::new(resources, EventLoop::new());
    player::register_actions(&mut conductor);
    conductor.vars_mut().load_system(&config.system_file)?;
    conductor.start_script(&file, run_args.label.as_deref())?;
    log::debug!("Playing '{}'.", file);

    let mut player = TerminalPlayer::new(io::stdout());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if conductor.conduct(&mut player)? == ConductorStatus::Stop {
            break;
        }

        let event_loop = conductor.event_loop().clone();
        if event_loop.has_queued_jobs() {
            event_loop.tick(Instant::now());
            continue;
        }
        if event_loop.is_idle() && !player.is_awaiting_input() {
            return Err(PlayerError::Stalled.into());
        }

        let deadline = event_loop.next_deadline();
        let timer = async move {
            match deadline {
                Some(due) => tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                return Err(PlayerError::Interrupted.into());
            }
            line = lines.next_line(), if player.is_awaiting_input() => {
                if line?.is_none() {
                    log::debug!("Standard input closed, ending playback.");
                    break;
                }
                player.press_enter();
            }
            _ = timer => {}
        }
        event_loop.tick(Instant::now());
    }

    conductor
        .vars()
        .save_system(&config.system_file)
        .context("Failed to save system variables")?;
    println!("\n{}", "[end of script]".dimmed());
    Ok(())
}
