// src/system/player.rs

//! # Terminal Player
//!
//! A minimal host that plays scripts on a text terminal. It implements the handful of
//! presentation tags a script needs to be readable without a renderer:
//!
//! | Tag              | Effect                                        |
//! |------------------|-----------------------------------------------|
//! | `ch`             | prints the character                          |
//! | `__line_break__` | prints a newline                              |
//! | `l`              | waits for Enter                               |
//! | `p`              | waits for Enter, then starts a new paragraph  |
//! | `wait time:ms`   | sleeps on the event loop                      |

use crate::{
    constants::{TAG_CH, TAG_LINE_BREAK},
    core::{
        async_task::AsyncCallbacks,
        conductor::Conductor,
        tag_action::{ActionContext, ActionResult, ParamDef, ParamType, TagAction},
    },
    models::TagValues,
};
use anyhow::Result;
use serde_json::Value;
use std::{
    io::Write,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Ways terminal playback can end other than reaching the end of the script.
#[derive(Error, Debug)]
pub enum PlayerError {
    /// The user pressed Ctrl+C.
    #[error("Playback was interrupted.")]
    Interrupted,
    /// Nothing is scheduled and no input is awaited, so the conductor can never wake.
    #[error("Playback stalled: the script is waiting for something that will never happen.")]
    Stalled,
}

const CLICK_MARKER: &str = " <";

/// Writes script output to `W` and tracks whether it is waiting for the reader.
#[derive(Debug)]
pub struct TerminalPlayer<W: Write> {
    out: W,
    awaiting_input: Option<AsyncCallbacks>,
}

impl<W: Write> TerminalPlayer<W> {
    /// Creates a player writing to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            awaiting_input: None,
        }
    }

    /// `true` while an `l` or `p` is waiting for Enter.
    pub fn is_awaiting_input(&self) -> bool {
        self.awaiting_input.is_some()
    }

    /// Resolves a pending `l`/`p` wait. Returns `false` when nothing was waiting.
    pub fn press_enter(&mut self) -> bool {
        match self.awaiting_input.take() {
            Some(callbacks) => callbacks.call_done(()),
            None => false,
        }
    }

    /// Everything written so far.
    pub fn output(&self) -> &W {
        &self.out
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn wait_for_input(&mut self) -> Result<ActionResult> {
        self.write(CLICK_MARKER)?;
        let callbacks = AsyncCallbacks::new();
        self.awaiting_input = Some(callbacks.clone());
        Ok(ActionResult::Wait(callbacks))
    }
}

/// The actions of the terminal player, ready to be registered on a conductor.
pub fn actions<W: Write>() -> Vec<TagAction<TerminalPlayer<W>>> {
    vec![
        TagAction::new(&[TAG_CH], print_char::<W>)
            .with_param(ParamDef::required("text", ParamType::String)),
        TagAction::new(&[TAG_LINE_BREAK], line_break::<W>),
        TagAction::new(&["l"], wait_line::<W>),
        TagAction::new(&["p"], wait_page::<W>),
        TagAction::new(&["wait"], wait_time::<W>)
            .with_param(ParamDef::required("time", ParamType::Number)),
    ]
}

/// Registers every action of [`actions`] on `conductor`.
pub fn register_actions<W: Write>(conductor: &mut Conductor<TerminalPlayer<W>>) {
    for action in actions() {
        conductor.register(action);
    }
}

fn print_char<W: Write>(
    player: &mut TerminalPlayer<W>,
    values: &TagValues,
    _: &mut ActionContext<'_>,
) -> Result<ActionResult> {
    player.write(values.get("text").and_then(Value::as_str).unwrap_or_default())?;
    Ok(ActionResult::Continue)
}

fn line_break<W: Write>(
    player: &mut TerminalPlayer<W>,
    _: &TagValues,
    _: &mut ActionContext<'_>,
) -> Result<ActionResult> {
    player.write("\n")?;
    Ok(ActionResult::Continue)
}

fn wait_line<W: Write>(
    player: &mut TerminalPlayer<W>,
    _: &TagValues,
    _: &mut ActionContext<'_>,
) -> Result<ActionResult> {
    player.wait_for_input()
}

fn wait_page<W: Write>(
    player: &mut TerminalPlayer<W>,
    _: &TagValues,
    _: &mut ActionContext<'_>,
) -> Result<ActionResult> {
    let result = player.wait_for_input()?;
    player.write("\n")?;
    Ok(result)
}

fn wait_time<W: Write>(
    _: &mut TerminalPlayer<W>,
    values: &TagValues,
    context: &mut ActionContext<'_>,
) -> Result<ActionResult> {
    let millis = values.get("time").and_then(Value::as_f64).unwrap_or(0.0);
    let delay = Duration::try_from_secs_f64(millis.max(0.0) / 1000.0).unwrap_or_default();
    log::trace!("Sleeping for {:?}.", delay);
    Ok(ActionResult::Wait(
        context.event_loop.sleep(Instant::now(), delay),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            async_task::EventLoop, conductor::ConductorStatus, expression::BasicEvaluator,
            resource::ResourceManager,
        },
        models::{Grammar, ResolvedConfig},
    };
    use std::{fs, sync::Arc};
    use tempfile::{TempDir, tempdir};

    fn setup(source: &str) -> (TempDir, Conductor<TerminalPlayer<Vec<u8>>>) {
        let dir = tempdir().unwrap();
        let scripts_dir = dir.path().join("scenario");
        fs::create_dir_all(&scripts_dir).unwrap();
        fs::write(scripts_dir.join("start.pon"), source).unwrap();
        let config = ResolvedConfig {
            scripts_dir,
            first_script: "start.pon".to_string(),
            grammar: Grammar::Line,
            max_macro_depth: 8,
            cache_dir: None,
            system_file: dir.path().join("system.json"),
        };
        let resources = ResourceManager::new(&config, Arc::new(BasicEvaluator::new()));
        let mut conductor = Conductor::new(resources, EventLoop::new());
        register_actions(&mut conductor);
        conductor.start_script("start.pon", None).unwrap();
        (dir, conductor)
    }

    fn printed(player: &TerminalPlayer<Vec<u8>>) -> String {
        String::from_utf8(player.output().clone()).unwrap()
    }

    #[test]
    fn test_prints_text_and_waits_for_enter() {
        // --- Setup ---
        let (_dir, mut conductor) = setup("Hello\n;l\nWorld\n;p\nEnd\n");
        let mut player = TerminalPlayer::new(Vec::new());

        // --- Execute & Assert ---
        assert_eq!(conductor.conduct(&mut player).unwrap(), ConductorStatus::Sleep);
        assert_eq!(printed(&player), "Hello\n <");
        assert!(player.is_awaiting_input());

        assert!(player.press_enter());
        assert!(!player.press_enter());
        assert_eq!(conductor.conduct(&mut player).unwrap(), ConductorStatus::Sleep);
        assert_eq!(printed(&player), "Hello\n <World\n <\n");

        player.press_enter();
        assert_eq!(conductor.conduct(&mut player).unwrap(), ConductorStatus::Stop);
        assert_eq!(printed(&player), "Hello\n <World\n <\nEnd\n");
    }

    #[test]
    fn test_wait_sleeps_on_the_event_loop() {
        let (_dir, mut conductor) = setup("a\n;wait {time: 20}\nb\n");
        let mut player = TerminalPlayer::new(Vec::new());

        assert_eq!(conductor.conduct(&mut player).unwrap(), ConductorStatus::Sleep);
        let deadline = conductor.event_loop().next_deadline().unwrap();
        conductor.event_loop().tick(deadline);
        assert_eq!(conductor.conduct(&mut player).unwrap(), ConductorStatus::Stop);
        assert_eq!(printed(&player), "a\nb\n");
    }
}
