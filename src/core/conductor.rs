// src/core/conductor.rs

//! # Conductor
//!
//! Pulls tags from the current [`Script`] and executes them. Control directives
//! (`if`, `for`, `macro`, `jump`, `call`, ...) are handled here; every other tag is
//! routed to a host-registered [`TagAction`].
//!
//! The conductor never blocks. It is a small state machine:
//!
//! - `Run`: [`Conductor::conduct`] keeps pulling tags.
//! - `Sleep`: an action returned `Wait`, or a script is loading. The driver ticks the
//!   [`EventLoop`] and calls `conduct` again; the conductor resumes once the awaited
//!   callbacks have settled.
//! - `Stop`: the script ended, reached `s`, or an action asked for a break. The host
//!   resumes with [`Conductor::start`].

use crate::{
    constants::{
        BODY_KEY, DEFAULT_INDEX_VAR, DEFERRED_EXPRESSION_PREFIX, TAG_BREAKFOR, TAG_CALL,
        TAG_ELSE, TAG_ELSIF, TAG_ENDFOR, TAG_ENDIF, TAG_ENDMACRO, TAG_FOR, TAG_IF, TAG_JS,
        TAG_JUMP, TAG_LABEL, TAG_MACRO, TAG_RETURN, TAG_SAVE_MARK, TAG_STOP,
    },
    core::{
        async_task::{AsyncCallbacks, AsyncTaskError, EventLoop, Fault},
        expression::{EvalError, Scope, is_truthy, to_display_string},
        frontend::ParseError,
        line_parser::char_tag,
        resource::{ResourceError, ResourceManager},
        script::{Script, ScriptError},
        tag_action::{ActionContext, ActionResult, ParamType, ParameterError, TagAction, type_name},
        variables::{Namespace, StorageError, VarContext},
    },
    models::{SaveData, Tag, TagValues},
};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    rc::Rc,
};
use thiserror::Error;

/// Every failure the conductor can report. Any of them stops execution.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// The script could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// An expression failed outside of a script context.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// A structural or evaluation fault of the running script.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// An async task was misused.
    #[error(transparent)]
    AsyncTask(#[from] AsyncTaskError),

    /// A script file could not be read or parsed.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// System variables could not be loaded or saved.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No built-in and no registered action handles this tag.
    #[error("Unknown tag '{name}' at line {line}")]
    UnknownTag {
        /// Name of the tag.
        name: String,
        /// 1-based source line of the tag.
        line: usize,
    },

    /// The tag's values do not satisfy its action's parameter declarations.
    #[error("Invalid parameters for tag '{tag}' at line {line}: {source}")]
    InvalidParameter {
        /// Name of the tag.
        tag: String,
        /// 1-based source line of the tag.
        line: usize,
        /// What did not match.
        #[source]
        source: ParameterError,
    },

    /// A handler returned an error, or the callbacks it waited on failed.
    #[error("Tag '{tag}' at line {line} failed: {message}")]
    Action {
        /// Name of the tag.
        tag: String,
        /// 1-based source line of the tag.
        line: usize,
        /// The handler's error, with its context chain.
        message: String,
    },

    /// `return` with no `call` to return to.
    #[error("'return' at line {line} has no matching 'call'")]
    CallStackEmpty {
        /// Line of the `return`.
        line: usize,
    },

    /// A script requested by `jump`, `call` or `restore` could not be loaded.
    #[error("Failed to load script '{file}': {fault}")]
    Load {
        /// Script path, relative to the scripts directory.
        file: String,
        /// Why the load failed.
        fault: Fault,
    },

    /// An operation needs a current script but none has been started.
    #[error("No script has been started")]
    NoScript,
}

/// Whether [`Conductor::conduct`] will pull more tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConductorStatus {
    /// Pulling tags.
    Run,
    /// Stopped until [`Conductor::start`] or a new script.
    Stop,
    /// Waiting for callbacks or a script load.
    Sleep,
}

/// The caller's cursor, saved by `call` and restored by `return`.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Cursor of the calling script, positioned after the `call`.
    pub script: Script,
}

#[derive(Debug, Clone, PartialEq)]
enum JumpTarget {
    Start,
    Label(String),
    SaveMark(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryMode {
    Jump,
    Call,
}

#[derive(Debug)]
enum Pending {
    Wait {
        callbacks: AsyncCallbacks,
        tag: String,
        line: usize,
    },
    Load {
        callbacks: AsyncCallbacks<Script>,
        file: String,
        target: JumpTarget,
        mode: EntryMode,
        /// `gv` to install once the file is entered, when restoring a save.
        restore: Option<TagValues>,
    },
}

/// Drives scripts against a host of type `H`.
pub struct Conductor<H> {
    resources: ResourceManager,
    vars: VarContext,
    event_loop: EventLoop,
    actions: HashMap<String, Rc<TagAction<H>>>,
    script: Option<Script>,
    call_stack: Vec<CallFrame>,
    /// Tags produced at run time (printed script output), dispatched before the script resumes.
    injected: VecDeque<Tag>,
    status: ConductorStatus,
    pending: Option<Pending>,
    /// `(file, mark)` of the last save-mark passed.
    latest_save_mark: Option<(String, String)>,
}

impl<H> fmt::Debug for Conductor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conductor")
            .field("status", &self.status)
            .field("script", &self.script.as_ref().map(Script::file_path))
            .field("call_depth", &self.call_stack.len())
            .field("actions", &self.actions.len())
            .field("pending", &self.pending)
            .finish()
    }
}

impl<H> Conductor<H> {
    /// Creates a stopped conductor without actions or script.
    pub fn new(resources: ResourceManager, event_loop: EventLoop) -> Self {
        Self {
            resources,
            vars: VarContext::new(),
            event_loop,
            actions: HashMap::new(),
            script: None,
            call_stack: Vec::new(),
            injected: VecDeque::new(),
            status: ConductorStatus::Stop,
            pending: None,
            latest_save_mark: None,
        }
    }

    /// Registers `action` under each of its names, replacing earlier registrations.
    pub fn register(&mut self, action: TagAction<H>) -> &mut Self {
        let action = Rc::new(action);
        for name in action.names() {
            if is_builtin(name) {
                log::warn!("Action '{}' is shadowed by the built-in tag of the same name.", name);
            }
            self.actions.insert(name.clone(), Rc::clone(&action));
        }
        self
    }

    /// `true` when an action is registered under `name`.
    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Current state.
    pub fn status(&self) -> ConductorStatus {
        self.status
    }

    /// Script variables.
    pub fn vars(&self) -> &VarContext {
        &self.vars
    }

    /// Mutable access to the script variables.
    pub fn vars_mut(&mut self) -> &mut VarContext {
        &mut self.vars
    }

    /// The loop that timers and loads are scheduled on.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Script loading and macro definitions.
    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// Mutable access to script loading and macros, e.g. for preloading.
    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }

    /// The running script cursor, if any.
    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    /// Number of `call`s waiting for a `return`.
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Name of the last save-mark passed in the current playthrough.
    pub fn latest_save_mark(&self) -> Option<&str> {
        self.latest_save_mark.as_ref().map(|(_, mark)| mark.as_str())
    }

    // --- LIFECYCLE ---

    /// Loads `file` synchronously and positions the cursor at `label`, or at the start.
    /// Any previous call stack and pending wait are discarded.
    pub fn start_script(&mut self, file: &str, label: Option<&str>) -> Result<(), ConductorError> {
        let mut script = self.resources.load_script(file)?;
        if let Some(label) = label {
            script.go_to_label(label)?;
        }
        log::debug!("Starting '{}' at {}.", file, label.unwrap_or("the beginning"));
        self.script = Some(script);
        self.call_stack.clear();
        self.injected.clear();
        self.pending = None;
        self.status = ConductorStatus::Run;
        Ok(())
    }

    /// Resumes after a break. Has no effect while sleeping or without a script.
    pub fn start(&mut self) {
        if self.status == ConductorStatus::Stop && self.script.is_some() {
            self.status = ConductorStatus::Run;
        }
    }

    /// Stops pulling tags and abandons whatever the conductor was waiting for.
    pub fn stop(&mut self) {
        if self.pending.take().is_some() {
            log::debug!("Abandoning a pending wait.");
        }
        self.status = ConductorStatus::Stop;
    }

    /// Executes tags until the conductor stops or has to sleep. Call again after
    /// ticking the event loop to resume a sleeping conductor.
    pub fn conduct(&mut self, host: &mut H) -> Result<ConductorStatus, ConductorError> {
        if self.status == ConductorStatus::Sleep
            && let Err(e) = self.poll_pending()
        {
            self.status = ConductorStatus::Stop;
            return Err(e);
        }

        while self.status == ConductorStatus::Run {
            let tag = match self.injected.pop_front() {
                Some(tag) => tag,
                None => {
                    let Some(script) = self.script.as_mut() else {
                        self.status = ConductorStatus::Stop;
                        break;
                    };
                    let resources = &self.resources;
                    let vars = &mut self.vars;
                    let next = script.get_next_tag_resolving(resources, &mut |call, params| {
                        resolve_deferred(resources, vars, params, call)
                    });
                    match next {
                        Ok(Some(tag)) => tag,
                        Ok(None) => {
                            log::debug!("Reached the end of '{}'.", script.file_path());
                            self.status = ConductorStatus::Stop;
                            break;
                        }
                        Err(e) => {
                            self.status = ConductorStatus::Stop;
                            return Err(e.into());
                        }
                    }
                }
            };

            if let Err(e) = self.dispatch(&tag, host) {
                self.status = ConductorStatus::Stop;
                return Err(e);
            }
        }
        Ok(self.status)
    }

    // --- SAVE / LOAD ---

    /// The resume point at the latest save-mark, or `None` before any was passed.
    pub fn snapshot(&self) -> Option<SaveData> {
        let (file_path, save_mark) = self.latest_save_mark.clone()?;
        Some(SaveData {
            file_path,
            save_mark,
            game_vars: self.vars.namespace(Namespace::Game).clone(),
        })
    }

    /// Reloads the saved file and sleeps until it is loaded. Once the cursor is placed
    /// after the save-mark, `gv` is replaced from `data` and `tv` and the call stack
    /// are cleared. A failed load or a missing save-mark leaves all of them untouched.
    pub fn restore(&mut self, data: SaveData) {
        log::debug!("Restoring '{}' at save-mark '{}'.", data.file_path, data.save_mark);
        let callbacks = self.resources.load_script_async(&data.file_path, &self.event_loop);
        self.pending = Some(Pending::Load {
            callbacks,
            file: data.file_path,
            target: JumpTarget::SaveMark(data.save_mark),
            mode: EntryMode::Jump,
            restore: Some(data.game_vars),
        });
        self.status = ConductorStatus::Sleep;
    }

    // --- PENDING OPERATIONS ---

    fn poll_pending(&mut self) -> Result<(), ConductorError> {
        let Some(pending) = self.pending.take() else {
            self.status = ConductorStatus::Run;
            return Ok(());
        };

        match pending {
            Pending::Wait {
                callbacks,
                tag,
                line,
            } => match callbacks.outcome() {
                None => {
                    self.pending = Some(Pending::Wait {
                        callbacks,
                        tag,
                        line,
                    });
                }
                Some(Ok(())) => {
                    log::trace!("Wait for '{}' at line {} resolved.", tag, line);
                    self.status = ConductorStatus::Run;
                }
                Some(Err(fault)) => {
                    return Err(ConductorError::Action {
                        tag,
                        line,
                        message: fault.to_string(),
                    });
                }
            },
            Pending::Load {
                callbacks,
                file,
                target,
                mode,
                restore,
            } => match callbacks.outcome() {
                None => {
                    self.pending = Some(Pending::Load {
                        callbacks,
                        file,
                        target,
                        mode,
                        restore,
                    });
                }
                Some(Ok(script)) => {
                    self.enter_script(script, target, mode)?;
                    if let Some(game_vars) = restore {
                        self.vars.clear_tmp();
                        self.vars.replace_game(game_vars);
                        self.call_stack.clear();
                        self.injected.clear();
                    }
                    self.status = ConductorStatus::Run;
                }
                Some(Err(fault)) => return Err(ConductorError::Load { file, fault }),
            },
        }
        Ok(())
    }

    fn enter_script(
        &mut self,
        mut script: Script,
        target: JumpTarget,
        mode: EntryMode,
    ) -> Result<(), ConductorError> {
        match &target {
            JumpTarget::Start => script.go_to_start(),
            JumpTarget::Label(label) => script.go_to_label(label)?,
            JumpTarget::SaveMark(mark) => {
                script.go_to_save_mark(mark)?;
                self.latest_save_mark = Some((script.file_path().to_string(), mark.clone()));
            }
        }
        if mode == EntryMode::Call
            && let Some(caller) = self.script.take()
        {
            self.call_stack.push(CallFrame { script: caller });
        }
        log::debug!(
            "Entered '{}' at {:?} (call depth {}).",
            script.file_path(),
            target,
            self.call_stack.len()
        );
        self.script = Some(script);
        Ok(())
    }

    // --- DISPATCH ---

    fn dispatch(&mut self, tag: &Tag, host: &mut H) -> Result<(), ConductorError> {
        log::trace!("Dispatching {}", tag);
        match tag.name() {
            TAG_LABEL => {}
            TAG_SAVE_MARK => self.pass_save_mark(tag),
            TAG_JS => self.run_script_tag(tag)?,
            TAG_STOP => self.status = ConductorStatus::Stop,
            TAG_IF => {
                let exp = required_str(tag, tag.values(), "exp")?;
                let script = self.script.as_mut().ok_or(ConductorError::NoScript)?;
                script.if_jump(exp, self.resources.evaluator(), &mut self.vars)?;
            }
            TAG_ELSIF => self.current_script()?.elsif_jump()?,
            TAG_ELSE => self.current_script()?.else_jump()?,
            TAG_ENDIF => self.current_script()?.end_if()?,
            TAG_FOR => {
                let values = self.resolve_values(tag)?;
                let loops = loop_count(tag, values.get("loops"))?;
                let index_var = values
                    .get("indexvar")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_INDEX_VAR);
                let script = self.script.as_mut().ok_or(ConductorError::NoScript)?;
                script.start_for_loop(loops, index_var, &mut self.vars)?;
            }
            TAG_ENDFOR => {
                let script = self.script.as_mut().ok_or(ConductorError::NoScript)?;
                script.end_for_loop(&mut self.vars)?;
            }
            TAG_BREAKFOR => self.current_script()?.break_for_loop()?,
            TAG_MACRO => {
                let values = self.resolve_values(tag)?;
                let name = required_str(tag, &values, "name")?;
                let definition = self.current_script()?.define_macro(name)?;
                log::debug!("Defined macro '{}' at line {}.", definition.name(), tag.line());
                self.resources.define_macro(definition);
            }
            TAG_ENDMACRO => {
                return Err(ScriptError::MacroDefinition {
                    line: tag.line(),
                    message: "'endmacro' without a matching 'macro'.".to_string(),
                }
                .into());
            }
            TAG_JUMP => self.jump(tag, EntryMode::Jump)?,
            TAG_CALL => self.jump(tag, EntryMode::Call)?,
            TAG_RETURN => {
                let frame = self
                    .call_stack
                    .pop()
                    .ok_or(ConductorError::CallStackEmpty { line: tag.line() })?;
                log::debug!("Returning to '{}'.", frame.script.file_path());
                self.script = Some(frame.script);
            }
            _ => self.run_action(tag, host)?,
        }
        Ok(())
    }

    fn current_script(&mut self) -> Result<&mut Script, ConductorError> {
        self.script.as_mut().ok_or(ConductorError::NoScript)
    }

    fn pass_save_mark(&mut self, tag: &Tag) {
        let name = tag.str_value("name").unwrap_or_default().to_string();
        let file = self
            .script
            .as_ref()
            .map(|s| s.file_path().to_string())
            .unwrap_or_default();
        if self.vars.mark_read(&file, &name) {
            log::debug!("First visit of save-mark '{}' in '{}'.", name, file);
        }
        self.latest_save_mark = Some((file, name));
    }

    fn run_script_tag(&mut self, tag: &Tag) -> Result<(), ConductorError> {
        let value = evaluate(
            &self.resources,
            &mut self.vars,
            self.script.as_ref().and_then(Script::macro_params),
            tag.body(),
            tag.line(),
        )?;
        if tag.value("print").is_some_and(is_truthy) {
            let text = to_display_string(&value);
            self.injected
                .extend(text.chars().map(|ch| char_tag(ch, tag.line())));
        }
        Ok(())
    }

    fn jump(&mut self, tag: &Tag, mode: EntryMode) -> Result<(), ConductorError> {
        let values = self.resolve_values(tag)?;
        let target = if let Some(label) = values.get("label").and_then(Value::as_str) {
            JumpTarget::Label(label.to_string())
        } else if let Some(mark) = values.get("mark").and_then(Value::as_str) {
            JumpTarget::SaveMark(mark.to_string())
        } else {
            JumpTarget::Start
        };

        let file = values
            .get("file")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty());
        let current = self.script.as_ref().map(Script::file_path);
        if let Some(file) = file
            && current != Some(file)
        {
            log::debug!("'{}' at line {} loads '{}'.", tag.name(), tag.line(), file);
            let callbacks = self.resources.load_script_async(file, &self.event_loop);
            self.pending = Some(Pending::Load {
                callbacks,
                file: file.to_string(),
                target,
                mode,
                restore: None,
            });
            self.status = ConductorStatus::Sleep;
            return Ok(());
        }

        let cursor = self
            .script
            .as_ref()
            .map(Script::new_cursor)
            .ok_or(ConductorError::NoScript)?;
        self.enter_script(cursor, target, mode)
    }

    fn run_action(&mut self, tag: &Tag, host: &mut H) -> Result<(), ConductorError> {
        let action = self
            .actions
            .get(tag.name())
            .cloned()
            .ok_or_else(|| ConductorError::UnknownTag {
                name: tag.name().to_string(),
                line: tag.line(),
            })?;
        let values = self.resolve_values(tag)?;
        let values = action
            .validate(values)
            .map_err(|source| ConductorError::InvalidParameter {
                tag: tag.name().to_string(),
                line: tag.line(),
                source,
            })?;

        let mut context = ActionContext {
            tag,
            vars: &mut self.vars,
            event_loop: &self.event_loop,
        };
        let result = action
            .call(host, &values, &mut context)
            .map_err(|e| ConductorError::Action {
                tag: tag.name().to_string(),
                line: tag.line(),
                message: format!("{:#}", e),
            })?;

        match result {
            ActionResult::Continue => {}
            ActionResult::Break => {
                log::debug!("'{}' at line {} breaks execution.", tag.name(), tag.line());
                self.status = ConductorStatus::Stop;
            }
            ActionResult::Wait(callbacks) => match callbacks.outcome() {
                None => {
                    self.pending = Some(Pending::Wait {
                        callbacks,
                        tag: tag.name().to_string(),
                        line: tag.line(),
                    });
                    self.status = ConductorStatus::Sleep;
                }
                Some(Ok(())) => {}
                Some(Err(fault)) => {
                    return Err(ConductorError::Action {
                        tag: tag.name().to_string(),
                        line: tag.line(),
                        message: fault.to_string(),
                    });
                }
            },
        }
        Ok(())
    }

    /// Copies the tag's values, evaluating every `&expression` string in the
    /// current variable and macro scope.
    fn resolve_values(&mut self, tag: &Tag) -> Result<TagValues, ConductorError> {
        let params = self.script.as_ref().and_then(Script::macro_params);
        Ok(resolve_deferred(&self.resources, &mut self.vars, params, tag)?)
    }
}

// --- HELPERS ---

fn is_builtin(name: &str) -> bool {
    [
        TAG_LABEL,
        TAG_SAVE_MARK,
        TAG_JS,
        TAG_STOP,
        TAG_IF,
        TAG_ELSIF,
        TAG_ELSE,
        TAG_ENDIF,
        TAG_FOR,
        TAG_ENDFOR,
        TAG_BREAKFOR,
        TAG_MACRO,
        TAG_ENDMACRO,
        TAG_JUMP,
        TAG_CALL,
        TAG_RETURN,
    ]
    .contains(&name)
}

/// Evaluates `source` with the variables and the given macro parameters as `mp`.
fn evaluate(
    resources: &ResourceManager,
    vars: &mut VarContext,
    params: Option<&TagValues>,
    source: &str,
    line: usize,
) -> Result<Value, ScriptError> {
    let mut scope = Scope::new(vars, params);
    resources
        .evaluator()
        .evaluate(source, &mut scope)
        .map_err(|source| ScriptError::Eval { line, source })
}

/// Copies the values of `tag`, replacing every `&expression` string by its result.
/// `params` is the `mp` the expressions see.
fn resolve_deferred(
    resources: &ResourceManager,
    vars: &mut VarContext,
    params: Option<&TagValues>,
    tag: &Tag,
) -> Result<TagValues, ScriptError> {
    let mut values = tag.values().clone();
    for (key, value) in values.iter_mut() {
        if key == BODY_KEY {
            continue;
        }
        let Some(source) = value
            .as_str()
            .and_then(|s| s.strip_prefix(DEFERRED_EXPRESSION_PREFIX))
        else {
            continue;
        };
        *value = evaluate(resources, vars, params, source, tag.line())?;
    }
    Ok(values)
}

fn required_str<'v>(tag: &Tag, values: &'v TagValues, param: &str) -> Result<&'v str, ScriptError> {
    values
        .get(param)
        .and_then(Value::as_str)
        .ok_or_else(|| ScriptError::MissingParameter {
            tag: tag.name().to_string(),
            param: param.to_string(),
            line: tag.line(),
        })
}

/// Reads a `for` loop count: a non-negative integer, given as a number or a numeric string.
fn loop_count(tag: &Tag, value: Option<&Value>) -> Result<u64, ConductorError> {
    let value = value.ok_or_else(|| ScriptError::MissingParameter {
        tag: tag.name().to_string(),
        param: "loops".to_string(),
        line: tag.line(),
    })?;
    let count = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    count.ok_or_else(|| ConductorError::InvalidParameter {
        tag: tag.name().to_string(),
        line: tag.line(),
        source: ParameterError::TypeMismatch {
            param: "loops".to_string(),
            expected: ParamType::Number,
            found: type_name(value),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{TAG_CH, TAG_LINE_BREAK},
        core::{expression::BasicEvaluator, tag_action::ParamDef},
        models::{Grammar, ResolvedConfig},
    };
    use anyhow::{Result, bail};
    use serde_json::json;
    use std::{
        fs,
        sync::Arc,
        time::{Duration, Instant},
    };
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct Recorder {
        out: String,
        pending_click: Option<AsyncCallbacks>,
    }

    fn on_text(host: &mut Recorder, values: &TagValues, _: &mut ActionContext<'_>) -> Result<ActionResult> {
        host.out.push_str(values.get("text").and_then(Value::as_str).unwrap_or(""));
        Ok(ActionResult::Continue)
    }

    fn on_line_break(host: &mut Recorder, _: &TagValues, _: &mut ActionContext<'_>) -> Result<ActionResult> {
        host.out.push('/');
        Ok(ActionResult::Continue)
    }

    fn on_show(host: &mut Recorder, values: &TagValues, _: &mut ActionContext<'_>) -> Result<ActionResult> {
        host.out.push_str(&to_display_string(values.get("value").unwrap_or(&Value::Null)));
        Ok(ActionResult::Continue)
    }

    fn on_break(host: &mut Recorder, _: &TagValues, _: &mut ActionContext<'_>) -> Result<ActionResult> {
        host.out.push('|');
        Ok(ActionResult::Break)
    }

    fn on_click(host: &mut Recorder, _: &TagValues, _: &mut ActionContext<'_>) -> Result<ActionResult> {
        let callbacks = AsyncCallbacks::new();
        host.pending_click = Some(callbacks.clone());
        Ok(ActionResult::Wait(callbacks))
    }

    fn on_wait(_: &mut Recorder, values: &TagValues, ctx: &mut ActionContext<'_>) -> Result<ActionResult> {
        let ms = values.get("time").and_then(Value::as_u64).unwrap_or(0);
        Ok(ActionResult::Wait(
            ctx.event_loop.sleep(Instant::now(), Duration::from_millis(ms)),
        ))
    }

    fn on_broken(_: &mut Recorder, _: &TagValues, _: &mut ActionContext<'_>) -> Result<ActionResult> {
        bail!("the projector is on fire")
    }

    fn setup(files: &[(&str, &str)]) -> (TempDir, Conductor<Recorder>) {
        let dir = tempdir().unwrap();
        let scripts_dir = dir.path().join("scenario");
        fs::create_dir_all(&scripts_dir).unwrap();
        for (name, source) in files {
            fs::write(scripts_dir.join(name), source).unwrap();
        }
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
        conductor
            .register(TagAction::new(&[TAG_CH, "mes"], on_text))
            .register(TagAction::new(&[TAG_LINE_BREAK], on_line_break))
            .register(
                TagAction::new(&["show"], on_show)
                    .with_param(ParamDef::optional("value", ParamType::Any, Some(json!("?")))),
            )
            .register(TagAction::new(&["l"], on_break))
            .register(TagAction::new(&["click"], on_click))
            .register(
                TagAction::new(&["wait"], on_wait)
                    .with_param(ParamDef::required("time", ParamType::Number)),
            )
            .register(TagAction::new(&["broken"], on_broken));
        (dir, conductor)
    }

    /// Conducts until the conductor stops, fast-forwarding the event loop while it sleeps.
    fn play(conductor: &mut Conductor<Recorder>, host: &mut Recorder) -> Result<ConductorStatus, ConductorError> {
        loop {
            let status = conductor.conduct(host)?;
            if status != ConductorStatus::Sleep || conductor.event_loop().is_idle() {
                return Ok(status);
            }
            let now = conductor.event_loop().next_deadline().unwrap_or_else(Instant::now);
            conductor.event_loop().tick(now);
        }
    }

    fn run(source: &str) -> Result<String, ConductorError> {
        let (_dir, mut conductor) = setup(&[("start.pon", source)]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None)?;
        play(&mut conductor, &mut host)?;
        Ok(host.out)
    }

    #[test]
    fn test_text_and_stop() {
        assert_eq!(run("ab\n;s\nnever\n").unwrap(), "ab/");
        assert_eq!(run("").unwrap(), "");
    }

    #[test]
    fn test_control_flow_builtins() {
        let source = "\
- tv.n = 2
;if {exp: \"tv.n == 1\"}
one
;elsif {exp: \"tv.n == 2\"}
two
;else
other
;endif
;for {loops: 3, indexvar: \"i\"}
= tv.i
;if {exp: \"tv.i == 1\"}
;breakfor
;endif
;endfor
";
        assert_eq!(run(source).unwrap(), "two/01");
    }

    #[test]
    fn test_macro_definition_and_parameters() {
        let source = "\
;macro {name: \"greet\"}
;mes {text: \"&'hi ' + mp.who\"}
;endmacro
;greet {who: \"Ann\"}
;greet {who: \"Bob\"}
";
        assert_eq!(run(source).unwrap(), "hi Annhi Bob");
    }

    #[test]
    fn test_macro_arguments_are_evaluated_at_the_call_site() {
        let source = "\
- gv.name = 'Yuki'
;macro {name: \"greet\"}
;mes {text: \"&'hi ' + mp.who\"}
;endmacro
;macro {name: \"relay\"}
;greet {who: \"&mp.name + '!'\"}
;endmacro
;greet {who: \"&gv.name\"}
;relay {name: \"Ann\"}
";
        assert_eq!(run(source).unwrap(), "hi Yukihi Ann!");
        assert!(matches!(
            run(";macro {name: \"m\"}\nx\n;endmacro\n;m {a: \"&nope.x\"}\n").unwrap_err(),
            ConductorError::Script(ScriptError::Eval { line: 4, .. })
        ));
    }

    #[test]
    fn test_guarded_recursive_macro_terminates() {
        let source = "\
;macro {name: \"count\"}
;if {exp: \"tv.n < 3\"}
= tv.n
- tv.n = tv.n + 1
;count
;endif
;endmacro
- tv.n = 0
;count
Z
";
        let (_dir, mut conductor) = setup(&[("start.pon", source)]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();
        play(&mut conductor, &mut host).unwrap();

        assert_eq!(host.out, "012Z/");
        let script = conductor.script().unwrap();
        assert_eq!(script.if_depth(), 0);
        assert!(!script.is_inside_of_macro());
    }

    #[test]
    fn test_deferred_values_read_variables() {
        let source = "- gv.name = 'Yuki'\n;show {value: \"&gv.name + '!'\"}\n;show\n";
        assert_eq!(run(source).unwrap(), "Yuki!?");
    }

    #[test]
    fn test_printed_script_dispatches_characters() {
        let (_dir, mut conductor) = setup(&[("start.pon", "= 6 * 7\n;l\nafter\n")]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();

        assert_eq!(play(&mut conductor, &mut host).unwrap(), ConductorStatus::Stop);
        assert_eq!(host.out, "42|");

        conductor.start();
        play(&mut conductor, &mut host).unwrap();
        assert_eq!(host.out, "42|after/");
    }

    #[test]
    fn test_same_file_jump_and_call() {
        let source = "\
;call {label: \"sub\"}
back
;jump {label: \"end\"}
skipped
*sub
in sub
;return
*end
done
";
        assert_eq!(run(source).unwrap(), "in sub/back/done/");
    }

    #[test]
    fn test_cross_file_call_sleeps_until_loaded() {
        // --- Setup ---
        let (_dir, mut conductor) = setup(&[
            ("start.pon", "a\n;call {file: \"other.pon\", label: \"entry\"}\nc\n"),
            ("other.pon", "x\n*entry\nb\n;return\n"),
        ]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();

        // --- Execute ---
        let first = conductor.conduct(&mut host).unwrap();
        let depth_while_loading = conductor.call_depth();
        let still_sleeping = conductor.conduct(&mut host).unwrap();
        conductor.event_loop().tick(Instant::now());
        let last = conductor.conduct(&mut host).unwrap();

        // --- Assert ---
        assert_eq!(first, ConductorStatus::Sleep);
        assert_eq!(still_sleeping, ConductorStatus::Sleep);
        assert_eq!(depth_while_loading, 0);
        assert_eq!(last, ConductorStatus::Stop);
        assert_eq!(host.out, "a/b/c/");
        assert_eq!(conductor.call_depth(), 0);
    }

    #[test]
    fn test_jump_to_missing_file_fails_after_tick() {
        let (_dir, mut conductor) = setup(&[("start.pon", ";jump {file: \"gone.pon\"}\n")]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();

        assert_eq!(conductor.conduct(&mut host).unwrap(), ConductorStatus::Sleep);
        conductor.event_loop().tick(Instant::now());
        let err = conductor.conduct(&mut host).unwrap_err();
        assert!(matches!(err, ConductorError::Load { ref file, .. } if file == "gone.pon"));
        assert_eq!(conductor.status(), ConductorStatus::Stop);
    }

    #[test]
    fn test_wait_actions_sleep_until_resolved() {
        // --- Setup ---
        let (_dir, mut conductor) = setup(&[("start.pon", "a\n;click\nb\n;wait {time: 50}\nc\n")]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();

        // --- Execute & Assert ---
        assert_eq!(conductor.conduct(&mut host).unwrap(), ConductorStatus::Sleep);
        assert_eq!(host.out, "a/");
        assert_eq!(conductor.conduct(&mut host).unwrap(), ConductorStatus::Sleep);

        host.pending_click.take().unwrap().call_done(());
        assert_eq!(conductor.conduct(&mut host).unwrap(), ConductorStatus::Sleep);
        assert_eq!(host.out, "a/b/");

        let deadline = conductor.event_loop().next_deadline().unwrap();
        conductor.event_loop().tick(deadline);
        assert_eq!(conductor.conduct(&mut host).unwrap(), ConductorStatus::Stop);
        assert_eq!(host.out, "a/b/c/");
    }

    #[test]
    fn test_failed_wait_surfaces_as_action_error() {
        let (_dir, mut conductor) = setup(&[("start.pon", ";click\n")]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();
        conductor.conduct(&mut host).unwrap();

        host.pending_click
            .take()
            .unwrap()
            .call_fail(Fault::failed("window closed"));
        let err = conductor.conduct(&mut host).unwrap_err();
        assert!(
            matches!(&err, ConductorError::Action { tag, line: 1, message } if tag == "click" && message == "window closed")
        );
    }

    #[test]
    fn test_dispatch_faults() {
        assert!(matches!(
            run("ok\n;nosuch {a: 1}\n").unwrap_err(),
            ConductorError::UnknownTag { ref name, line: 2 } if name == "nosuch"
        ));
        assert!(matches!(
            run(";wait {time: \"soon\"}\n").unwrap_err(),
            ConductorError::InvalidParameter { line: 1, .. }
        ));
        assert!(matches!(
            run(";wait\n").unwrap_err(),
            ConductorError::InvalidParameter {
                source: ParameterError::Missing(_),
                ..
            }
        ));
        assert!(matches!(
            run(";broken\n").unwrap_err(),
            ConductorError::Action { ref message, .. } if message.contains("on fire")
        ));
        assert!(matches!(
            run(";return\n").unwrap_err(),
            ConductorError::CallStackEmpty { line: 1 }
        ));
        assert!(matches!(
            run(";endmacro\n").unwrap_err(),
            ConductorError::Script(ScriptError::MacroDefinition { line: 1, .. })
        ));
        assert!(matches!(
            run(";if\n;endif\n").unwrap_err(),
            ConductorError::Script(ScriptError::MissingParameter { .. })
        ));
        assert!(matches!(
            run(";for {loops: -1}\n;endfor\n").unwrap_err(),
            ConductorError::InvalidParameter { .. }
        ));
        assert!(matches!(
            run(";jump {label: \"nowhere\"}\n").unwrap_err(),
            ConductorError::Script(ScriptError::LabelNotFound { .. })
        ));
    }

    #[test]
    fn test_loop_count_accepts_deferred_and_string_values() {
        assert_eq!(run("- tv.n = 2\n;for {loops: \"&tv.n\"}\nx\n;endfor\n").unwrap(), "x/x/");
        assert_eq!(run(";for {loops: \"3\"}\n= tv.__index__\n;endfor\n").unwrap(), "012");
    }

    #[test]
    fn test_snapshot_and_restore() {
        // --- Setup ---
        let source = "\
~intro|Opening
- gv.route = 'a'
- tv.scratch = 1
;l
~middle|Halfway
after middle
;l
";
        let (_dir, mut conductor) = setup(&[("start.pon", source)]);
        let mut host = Recorder::default();
        assert!(conductor.snapshot().is_none());
        conductor.start_script("start.pon", None).unwrap();
        play(&mut conductor, &mut host).unwrap();
        conductor.start();
        play(&mut conductor, &mut host).unwrap();

        // --- Execute ---
        let saved = conductor.snapshot().unwrap();
        conductor.vars_mut().set(Namespace::Game, "route", json!("b"));
        conductor.restore(saved.clone());
        let status_while_loading = conductor.status();
        host.out.clear();
        play(&mut conductor, &mut host).unwrap();

        // --- Assert ---
        assert_eq!(saved.file_path, "start.pon");
        assert_eq!(saved.save_mark, "middle");
        assert_eq!(saved.game_vars.get("route"), Some(&json!("a")));
        assert_eq!(status_while_loading, ConductorStatus::Sleep);
        assert_eq!(host.out, "after middle/|");
        assert_eq!(conductor.vars().get(Namespace::Game, "route"), Some(&json!("a")));
        assert_eq!(conductor.vars().get(Namespace::Tmp, "scratch"), None);
        assert!(conductor.vars().is_read("start.pon", "intro"));
        assert_eq!(conductor.latest_save_mark(), Some("middle"));
    }

    #[test]
    fn test_failed_restore_keeps_the_current_state() {
        // --- Setup ---
        let (_dir, mut conductor) =
            setup(&[("start.pon", "~here\n- tv.t = 'x'\n- gv.g = 'y'\n;l\n")]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();
        play(&mut conductor, &mut host).unwrap();
        let unknown_file = SaveData {
            file_path: "gone.pon".to_string(),
            save_mark: "here".to_string(),
            game_vars: TagValues::new(),
        };
        let unknown_mark = SaveData {
            file_path: "start.pon".to_string(),
            save_mark: "nope".to_string(),
            game_vars: TagValues::new(),
        };

        // --- Execute ---
        conductor.restore(unknown_file);
        let load_err = play(&mut conductor, &mut host).unwrap_err();
        conductor.restore(unknown_mark);
        let mark_err = play(&mut conductor, &mut host).unwrap_err();

        // --- Assert ---
        assert!(matches!(load_err, ConductorError::Load { ref file, .. } if file == "gone.pon"));
        assert!(matches!(
            mark_err,
            ConductorError::Script(ScriptError::SaveMarkNotFound { .. })
        ));
        assert_eq!(conductor.vars().get(Namespace::Game, "g"), Some(&json!("y")));
        assert_eq!(conductor.vars().get(Namespace::Tmp, "t"), Some(&json!("x")));
        assert_eq!(conductor.script().map(Script::file_path), Some("start.pon"));
    }

    #[test]
    fn test_start_script_at_label() {
        let (_dir, mut conductor) = setup(&[("start.pon", "a\n*two\nb\n")]);
        let mut host = Recorder::default();
        conductor.start_script("start.pon", Some("two")).unwrap();
        play(&mut conductor, &mut host).unwrap();
        assert_eq!(host.out, "b/");

        assert!(matches!(
            conductor.start_script("start.pon", Some("three")),
            Err(ConductorError::Script(ScriptError::LabelNotFound { .. }))
        ));
    }

    #[test]
    fn test_builtin_names_cannot_be_overridden() {
        let (_dir, mut conductor) = setup(&[("start.pon", ";s\nafter\n")]);
        conductor.register(TagAction::new(&[TAG_STOP], on_text));
        let mut host = Recorder::default();
        conductor.start_script("start.pon", None).unwrap();
        assert_eq!(play(&mut conductor, &mut host).unwrap(), ConductorStatus::Stop);
        assert_eq!(host.out, "");
        assert!(conductor.has_action(TAG_STOP));
    }
}
