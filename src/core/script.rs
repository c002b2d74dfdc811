// src/core/script.rs

//! # Script Cursor
//!
//! A [`Script`] walks a parsed tag sequence and implements structured control flow
//! by scanning and jumping rather than by building a tree:
//!
//! - **Macros** are expanded transparently inside [`Script::get_next_tag`]. Active
//!   invocations live on an explicit frame stack; the innermost frame is read first
//!   and popped when exhausted.
//! - **Conditionals** (`if`/`elsif`/`else`/`endif`) scan forward with a nesting counter.
//! - **Loops** (`for`/`endfor`/`breakfor`) remember their re-entry point in a frame stack.
//!
//! Scans operate on the current frame only and never expand macros.
//!
//! The parsed tags are shared (`Rc`) between every cursor created for the same file,
//! so [`Script::new_cursor`] is cheap.

use crate::{
    constants::{
        DEFAULT_MAX_MACRO_DEPTH, RESERVED_TAG_NAMES, TAG_ELSE, TAG_ELSIF, TAG_ENDFOR, TAG_ENDIF,
        TAG_ENDMACRO, TAG_FOR, TAG_IF, TAG_LABEL, TAG_MACRO, TAG_SAVE_MARK,
    },
    core::{
        expression::{EvalError, ExpressionEvaluator, Scope},
        macros::{Macro, MacroRegistry},
        variables::{Namespace, VarContext},
    },
    models::{ForLoopFrame, SaveMarkInfo, Tag, TagValues},
};
use serde_json::Value;
use std::rc::Rc;
use thiserror::Error;

/// Structural faults raised while executing a script.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// A `jump`, `call` or start label does not exist.
    #[error("Label '{label}' not found in '{file}'")]
    LabelNotFound {
        /// Script that was searched.
        file: String,
        /// The label that was looked up.
        label: String,
    },

    /// A `jump`, `call` or restore save-mark does not exist.
    #[error("Save-mark '{mark}' not found in '{file}'")]
    SaveMarkNotFound {
        /// Script that was searched.
        file: String,
        /// The save-mark that was looked up.
        mark: String,
    },

    /// Unbalanced `if`/`elsif`/`else`/`endif`.
    #[error("if/elsif/else/endif mismatch at line {line}: {message}")]
    IfMismatch {
        /// Line of the directive that exposed the mismatch.
        line: usize,
        /// Description of the failure.
        message: String,
    },

    /// Unbalanced `for`/`endfor`/`breakfor`.
    #[error("for/endfor mismatch at line {line}: {message}")]
    ForMismatch {
        /// Line of the directive that exposed the mismatch.
        line: usize,
        /// Description of the failure.
        message: String,
    },

    /// Invalid `macro ... endmacro` block.
    #[error("Invalid macro definition at line {line}: {message}")]
    MacroDefinition {
        /// Line of the `macro` tag, or of the offending tag in its body.
        line: usize,
        /// Description of the failure.
        message: String,
    },

    /// Too many nested macro invocations, usually unbounded recursion.
    #[error("Macro '{name}' exceeded the maximum nesting depth of {max_depth}")]
    MacroDepthExceeded {
        /// Macro whose invocation overflowed.
        name: String,
        /// The configured `max_macro_depth`.
        max_depth: usize,
    },

    /// A control tag lacks a parameter it cannot work without.
    #[error("Tag '{tag}' at line {line} requires the parameter '{param}'")]
    MissingParameter {
        /// Name of the tag.
        tag: String,
        /// The missing parameter.
        param: String,
        /// 1-based source line of the tag.
        line: usize,
    },

    /// A condition or loop expression failed to evaluate.
    #[error("Expression error at line {line}: {source}")]
    Eval {
        /// 1-based source line of the tag.
        line: usize,
        /// What the evaluator reported.
        #[source]
        source: EvalError,
    },
}

/// Computes the parameters of a macro invocation from the calling tag and the
/// parameters of the enclosing macro frame, if any.
pub type ParamResolver<'a> =
    dyn FnMut(&Tag, Option<&TagValues>) -> Result<TagValues, ScriptError> + 'a;

/// An execution cursor over one parsed script file.
#[derive(Debug, Clone)]
pub struct Script {
    file_path: String,
    tags: Rc<[Tag]>,
    tag_point: usize,
    macro_stack: Vec<Macro>,
    if_depth: usize,
    for_loop_stack: Vec<ForLoopFrame>,
    latest_tag: Option<Tag>,
    max_macro_depth: usize,
}

impl Script {
    /// A cursor at the start of `tags`, the parsed content of `file_path`.
    pub fn new(file_path: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            file_path: file_path.into(),
            tags: tags.into(),
            tag_point: 0,
            macro_stack: Vec::new(),
            if_depth: 0,
            for_loop_stack: Vec::new(),
            latest_tag: None,
            max_macro_depth: DEFAULT_MAX_MACRO_DEPTH,
        }
    }

    /// Sets the limit on nested macro frames.
    pub fn with_max_macro_depth(mut self, max_macro_depth: usize) -> Self {
        self.max_macro_depth = max_macro_depth;
        self
    }

    /// A cursor at the start of the same tag sequence, with fresh control-flow state.
    pub fn new_cursor(&self) -> Self {
        Self {
            file_path: self.file_path.clone(),
            tags: Rc::clone(&self.tags),
            tag_point: 0,
            macro_stack: Vec::new(),
            if_depth: 0,
            for_loop_stack: Vec::new(),
            latest_tag: None,
            max_macro_depth: self.max_macro_depth,
        }
    }

    /// Script path, relative to the scripts directory.
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// The whole parsed tag sequence.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Position of the cursor in the base sequence.
    pub fn tag_point(&self) -> usize {
        self.tag_point
    }

    /// Number of open `if` blocks.
    pub fn if_depth(&self) -> usize {
        self.if_depth
    }

    /// Number of active macro invocations.
    pub fn macro_depth(&self) -> usize {
        self.macro_stack.len()
    }

    /// Number of active loops.
    pub fn for_loop_depth(&self) -> usize {
        self.for_loop_stack.len()
    }

    /// `true` while a macro invocation is being read.
    pub fn is_inside_of_macro(&self) -> bool {
        !self.macro_stack.is_empty()
    }

    /// `true` inside at least one `if` block.
    pub fn is_inside_of_if(&self) -> bool {
        self.if_depth > 0
    }

    /// `true` inside at least one loop.
    pub fn is_inside_of_for_loop(&self) -> bool {
        !self.for_loop_stack.is_empty()
    }

    /// Parameters of the innermost running macro, if any.
    pub fn macro_params(&self) -> Option<&TagValues> {
        self.macro_stack.last().map(Macro::params)
    }

    /// The tag most recently returned by [`Script::get_next_tag`].
    pub fn latest_tag(&self) -> Option<&Tag> {
        self.latest_tag.as_ref()
    }

    // --- TAG DELIVERY ---

    /// Returns the next leaf tag in execution order, or `None` at the end of the script.
    ///
    /// Tags naming a registered macro are never returned: a fresh invocation is pushed
    /// and its first tag is returned instead. The invocation's parameters are the
    /// calling tag's values as written; use [`Script::get_next_tag_resolving`] to
    /// evaluate them first.
    pub fn get_next_tag(
        &mut self,
        registry: &dyn MacroRegistry,
    ) -> Result<Option<Tag>, ScriptError> {
        self.get_next_tag_resolving(registry, &mut |call, _| Ok(call.values().clone()))
    }

    /// Like [`Script::get_next_tag`], but the parameters of every macro invocation are
    /// produced by `resolve`. It receives the calling tag and the parameters of the
    /// frame the call appears in, so arguments can forward the caller's own `mp`.
    pub fn get_next_tag_resolving(
        &mut self,
        registry: &dyn MacroRegistry,
        resolve: &mut ParamResolver<'_>,
    ) -> Result<Option<Tag>, ScriptError> {
        loop {
            let tag = if let Some(frame) = self.macro_stack.last_mut() {
                match frame.get_next_tag() {
                    Some(tag) => tag,
                    None => {
                        self.pop_macro_frame();
                        continue;
                    }
                }
            } else {
                match self.tags.get(self.tag_point) {
                    Some(tag) => {
                        self.tag_point += 1;
                        tag.clone()
                    }
                    None => return Ok(None),
                }
            };

            if registry.has_macro(tag.name())
                && let Some(definition) = registry.get_macro(tag.name())
            {
                let params = resolve(&tag, self.macro_params())?;
                self.push_macro_frame(definition, &tag, params)?;
                continue;
            }

            self.latest_tag = Some(tag.clone());
            return Ok(Some(tag));
        }
    }

    /// Peeks at the tag the next call to [`Script::get_next_tag`] would read, without
    /// expanding macros.
    pub fn get_current_tag(&self) -> Option<&Tag> {
        self.macro_stack
            .iter()
            .rev()
            .find_map(|m| m.tags().get(m.tag_point()))
            .or_else(|| self.tags.get(self.tag_point))
    }

    fn push_macro_frame(
        &mut self,
        definition: Macro,
        call: &Tag,
        params: TagValues,
    ) -> Result<(), ScriptError> {
        if self.macro_stack.len() >= self.max_macro_depth {
            return Err(ScriptError::MacroDepthExceeded {
                name: definition.name().to_string(),
                max_depth: self.max_macro_depth,
            });
        }
        log::debug!(
            "Entering macro '{}' from line {} (depth {}).",
            definition.name(),
            call.line(),
            self.macro_stack.len() + 1
        );
        self.macro_stack
            .push(definition.instantiate(params));
        Ok(())
    }

    fn pop_macro_frame(&mut self) {
        if let Some(frame) = self.macro_stack.pop() {
            log::debug!("Leaving macro '{}'.", frame.name());
        }
        // Loops opened inside the finished frame can no longer be re-entered.
        let depth = self.macro_stack.len();
        self.for_loop_stack.retain(|f| f.frame_depth <= depth);
    }

    // --- CURRENT FRAME ---

    fn frame_tags(&self) -> Rc<[Tag]> {
        match self.macro_stack.last() {
            Some(frame) => frame.shared_tags(),
            None => Rc::clone(&self.tags),
        }
    }

    fn frame_point(&self) -> usize {
        self.macro_stack
            .last()
            .map_or(self.tag_point, Macro::tag_point)
    }

    fn set_frame_point(&mut self, point: usize) {
        match self.macro_stack.last_mut() {
            Some(frame) => frame.set_tag_point(point),
            None => self.tag_point = point,
        }
    }

    fn latest_line(&self) -> usize {
        self.latest_tag.as_ref().map_or(0, Tag::line)
    }

    // --- NAVIGATION ---

    /// Moves the base cursor to `point` and drops all macro, if and loop state.
    pub fn go_to(&mut self, point: usize) {
        self.macro_stack.clear();
        self.for_loop_stack.clear();
        self.if_depth = 0;
        self.latest_tag = None;
        self.tag_point = point.min(self.tags.len());
    }

    /// Moves the cursor back to the first tag.
    pub fn go_to_start(&mut self) {
        self.go_to(0);
    }

    /// Positions the cursor just after the first `*label` with the given name.
    pub fn go_to_label(&mut self, label: &str) -> Result<(), ScriptError> {
        let index = self
            .tags
            .iter()
            .position(|t| t.name() == TAG_LABEL && t.body() == label)
            .ok_or_else(|| ScriptError::LabelNotFound {
                file: self.file_path.clone(),
                label: label.to_string(),
            })?;
        log::debug!("Jumping to label '{}' in '{}'.", label, self.file_path);
        self.go_to(index + 1);
        Ok(())
    }

    /// Positions the cursor just after the first save-mark with the given name.
    pub fn go_to_save_mark(&mut self, mark: &str) -> Result<(), ScriptError> {
        let index = self
            .tags
            .iter()
            .position(|t| t.name() == TAG_SAVE_MARK && t.str_value("name") == Some(mark))
            .ok_or_else(|| ScriptError::SaveMarkNotFound {
                file: self.file_path.clone(),
                mark: mark.to_string(),
            })?;
        log::debug!("Jumping to save-mark '{}' in '{}'.", mark, self.file_path);
        self.go_to(index + 1);
        Ok(())
    }

    /// Every save-mark of the script, in document order.
    pub fn save_marks(&self) -> Vec<SaveMarkInfo> {
        self.tags
            .iter()
            .filter(|t| t.name() == TAG_SAVE_MARK)
            .map(|t| SaveMarkInfo {
                name: t.str_value("name").unwrap_or_default().to_string(),
                comment: t.str_value("comment").unwrap_or_default().to_string(),
                line: t.line(),
            })
            .collect()
    }

    /// Every label name of the script, in document order.
    pub fn labels(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.name() == TAG_LABEL)
            .map(Tag::body)
            .collect()
    }

    // --- CONDITIONALS ---

    fn evaluate_condition(
        &self,
        exp: &str,
        line: usize,
        evaluator: &dyn ExpressionEvaluator,
        vars: &mut VarContext,
    ) -> Result<bool, ScriptError> {
        let mut scope = Scope::new(vars, self.macro_params());
        evaluator
            .evaluate_bool(exp, &mut scope)
            .map_err(|source| ScriptError::Eval { line, source })
    }

    /// Enters an `if` block. When `exp` is false the cursor moves to the first
    /// `elsif` whose condition holds, the `else`, or past the matching `endif`.
    pub fn if_jump(
        &mut self,
        exp: &str,
        evaluator: &dyn ExpressionEvaluator,
        vars: &mut VarContext,
    ) -> Result<(), ScriptError> {
        let line = self.latest_line();
        let taken = self.evaluate_condition(exp, line, evaluator, vars)?;
        self.if_depth += 1;
        if taken {
            return Ok(());
        }

        let tags = self.frame_tags();
        let mut point = self.frame_point();
        let mut nested = 0usize;
        while let Some(tag) = tags.get(point) {
            point += 1;
            match tag.name() {
                TAG_IF => nested += 1,
                TAG_ENDIF if nested > 0 => nested -= 1,
                TAG_ENDIF => {
                    self.set_frame_point(point);
                    self.if_depth -= 1;
                    return Ok(());
                }
                TAG_ELSE if nested == 0 => {
                    self.set_frame_point(point);
                    return Ok(());
                }
                TAG_ELSIF if nested == 0 => {
                    let exp = tag.str_value("exp").ok_or_else(|| {
                        ScriptError::MissingParameter {
                            tag: TAG_ELSIF.to_string(),
                            param: "exp".to_string(),
                            line: tag.line(),
                        }
                    })?;
                    match self.evaluate_condition(exp, tag.line(), evaluator, vars) {
                        Ok(true) => {
                            self.set_frame_point(point);
                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.if_depth -= 1;
                            return Err(e);
                        }
                    }
                }
                _ => {}
            }
        }
        Err(ScriptError::IfMismatch {
            line,
            message: "'if' has no matching 'endif'.".to_string(),
        })
    }

    /// Reached at an `elsif` after a taken branch: skips to the matching `endif`.
    pub fn elsif_jump(&mut self) -> Result<(), ScriptError> {
        self.skip_to_endif(TAG_ELSIF)
    }

    /// Reached at an `else` after a taken branch: skips to the matching `endif`.
    pub fn else_jump(&mut self) -> Result<(), ScriptError> {
        self.skip_to_endif(TAG_ELSE)
    }

    /// Leaves the innermost `if` block.
    pub fn end_if(&mut self) -> Result<(), ScriptError> {
        if self.if_depth == 0 {
            return Err(ScriptError::IfMismatch {
                line: self.latest_line(),
                message: "'endif' without a matching 'if'.".to_string(),
            });
        }
        self.if_depth -= 1;
        Ok(())
    }

    fn skip_to_endif(&mut self, from: &str) -> Result<(), ScriptError> {
        let line = self.latest_line();
        if self.if_depth == 0 {
            return Err(ScriptError::IfMismatch {
                line,
                message: format!("'{}' outside of an 'if' block.", from),
            });
        }
        let tags = self.frame_tags();
        let mut point = self.frame_point();
        let mut nested = 0usize;
        while let Some(tag) = tags.get(point) {
            point += 1;
            match tag.name() {
                TAG_IF => nested += 1,
                TAG_ENDIF if nested > 0 => nested -= 1,
                TAG_ENDIF => {
                    self.set_frame_point(point);
                    self.if_depth -= 1;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(ScriptError::IfMismatch {
            line,
            message: format!("'{}' has no matching 'endif'.", from),
        })
    }

    // --- LOOPS ---

    /// Starts a loop whose body runs `loops` times. The index variable lives in `tv`.
    /// With `loops == 0` the body is skipped entirely.
    pub fn start_for_loop(
        &mut self,
        loops: u64,
        index_var: &str,
        vars: &mut VarContext,
    ) -> Result<(), ScriptError> {
        if loops == 0 {
            return self.skip_loop_body();
        }
        self.for_loop_stack.push(ForLoopFrame {
            start_point: self.frame_point(),
            frame_depth: self.macro_stack.len(),
            index_var: index_var.to_string(),
            loops,
            count: 0,
        });
        vars.set(Namespace::Tmp, index_var, Value::from(0u64));
        log::debug!("Starting loop of {} iterations over 'tv.{}'.", loops, index_var);
        Ok(())
    }

    /// Ends one iteration: jumps back to the loop start or falls through after the last.
    pub fn end_for_loop(&mut self, vars: &mut VarContext) -> Result<(), ScriptError> {
        let line = self.latest_line();
        let depth = self.macro_stack.len();
        let frame = match self.for_loop_stack.last_mut() {
            Some(frame) if frame.frame_depth == depth => frame,
            _ => {
                return Err(ScriptError::ForMismatch {
                    line,
                    message: "'endfor' without a matching 'for'.".to_string(),
                });
            }
        };

        frame.count += 1;
        if frame.count < frame.loops {
            vars.set(Namespace::Tmp, frame.index_var.clone(), Value::from(frame.count));
            let start = frame.start_point;
            self.set_frame_point(start);
        } else {
            self.for_loop_stack.pop();
        }
        Ok(())
    }

    /// Leaves the innermost loop immediately: moves past its `endfor` and pops its frame.
    ///
    /// The loop must have been opened in the current frame; a macro body cannot break
    /// out of a loop that encloses its call site.
    pub fn break_for_loop(&mut self) -> Result<(), ScriptError> {
        let depth = self.macro_stack.len();
        let message = match self.for_loop_stack.last() {
            Some(frame) if frame.frame_depth == depth => None,
            Some(_) => Some("'breakfor' cannot leave the macro it appears in."),
            None => Some("'breakfor' outside of a 'for' loop."),
        };
        if let Some(message) = message {
            return Err(ScriptError::ForMismatch {
                line: self.latest_line(),
                message: message.to_string(),
            });
        }
        self.skip_loop_body()?;
        self.for_loop_stack.pop();
        Ok(())
    }

    /// Moves past the `endfor` matching the current nesting level. `if` blocks left
    /// open on the way out are closed.
    fn skip_loop_body(&mut self) -> Result<(), ScriptError> {
        let line = self.latest_line();
        let tags = self.frame_tags();
        let mut point = self.frame_point();
        let mut nested_for = 0usize;
        let mut nested_if = 0usize;
        let mut closed_ifs = 0usize;

        while let Some(tag) = tags.get(point) {
            point += 1;
            match tag.name() {
                TAG_FOR => nested_for += 1,
                TAG_ENDFOR if nested_for > 0 => nested_for -= 1,
                TAG_ENDFOR => {
                    self.if_depth = self.if_depth.checked_sub(closed_ifs).ok_or_else(|| {
                        ScriptError::IfMismatch {
                            line,
                            message: "Loop body closes more 'if' blocks than it opens."
                                .to_string(),
                        }
                    })?;
                    self.set_frame_point(point);
                    return Ok(());
                }
                TAG_IF => nested_if += 1,
                TAG_ENDIF if nested_if > 0 => nested_if -= 1,
                TAG_ENDIF => closed_ifs += 1,
                _ => {}
            }
        }
        Err(ScriptError::ForMismatch {
            line,
            message: "'for' has no matching 'endfor'.".to_string(),
        })
    }

    // --- MACRO DEFINITION ---

    /// Consumes the body of a `macro` block up to its `endmacro` and returns the definition.
    ///
    /// Labels, save-marks and nested definitions are rejected, as is an empty body.
    pub fn define_macro(&mut self, name: &str) -> Result<Macro, ScriptError> {
        let line = self.latest_line();
        let name = name.trim();
        if name.is_empty() {
            return Err(ScriptError::MacroDefinition {
                line,
                message: "Macro name is empty.".to_string(),
            });
        }
        if RESERVED_TAG_NAMES.contains(&name) {
            return Err(ScriptError::MacroDefinition {
                line,
                message: format!("'{}' is a reserved tag name.", name),
            });
        }

        let tags = self.frame_tags();
        let mut point = self.frame_point();
        let mut body = Vec::new();
        loop {
            let tag = tags.get(point).ok_or_else(|| ScriptError::MacroDefinition {
                line,
                message: format!("Macro '{}' has no matching 'endmacro'.", name),
            })?;
            point += 1;
            match tag.name() {
                TAG_ENDMACRO => break,
                TAG_LABEL | TAG_SAVE_MARK => {
                    return Err(ScriptError::MacroDefinition {
                        line: tag.line(),
                        message: format!(
                            "Labels and save-marks are not allowed inside macro '{}'.",
                            name
                        ),
                    });
                }
                TAG_MACRO => {
                    return Err(ScriptError::MacroDefinition {
                        line: tag.line(),
                        message: format!("Macro '{}' contains a nested definition.", name),
                    });
                }
                _ => body.push(tag.clone()),
            }
        }
        self.set_frame_point(point);

        if body.is_empty() {
            return Err(ScriptError::MacroDefinition {
                line,
                message: format!("Macro '{}' has an empty body.", name),
            });
        }
        Ok(Macro::new(name, body, line))
    }
}
