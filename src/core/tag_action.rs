// src/core/tag_action.rs

//! # Tag Actions
//!
//! A [`TagAction`] binds one or more tag names to a host handler and declares the
//! parameters the handler expects. The conductor validates a tag's values against
//! those declarations before calling the handler, so handlers can read their
//! parameters without re-checking presence or type.

use crate::{
    core::{async_task::{AsyncCallbacks, EventLoop}, variables::VarContext},
    models::{Tag, TagValues},
};
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// The JSON shape a parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// A JSON string.
    String,
    /// A JSON number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
    /// Anything, including `null`.
    Any,
}

impl ParamType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declares one expected parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    /// Key in the tag's values.
    pub name: String,
    /// Required shape of the value.
    pub param_type: ParamType,
    /// Whether a missing value is an error.
    pub required: bool,
    /// Value used when the parameter is absent.
    pub default: Option<Value>,
}

impl ParamDef {
    /// A parameter that must be present.
    pub fn required(name: &str, param_type: ParamType) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
            default: None,
        }
    }

    /// An optional parameter. `default` is filled in when the tag omits it.
    pub fn optional(name: &str, param_type: ParamType, default: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: false,
            default,
        }
    }
}

/// Why a tag's values do not match its action's declarations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    /// A required parameter is absent.
    #[error("missing required parameter '{0}'")]
    Missing(String),
    /// A parameter has the wrong JSON type.
    #[error("parameter '{param}' must be a {expected}, got {found}")]
    TypeMismatch {
        /// Name of the parameter.
        param: String,
        /// Type the action declared.
        expected: ParamType,
        /// JSON type that was found.
        found: &'static str,
    },
}

/// What the conductor does after a handler returns.
#[derive(Debug, Clone)]
pub enum ActionResult {
    /// Keep pulling tags.
    Continue,
    /// Stop; the host resumes with `Conductor::start`.
    Break,
    /// Sleep until the callbacks resolve.
    Wait(AsyncCallbacks),
}

/// Engine services lent to a handler for the duration of one call.
#[derive(Debug)]
pub struct ActionContext<'a> {
    /// The tag being executed.
    pub tag: &'a Tag,
    /// Script variables.
    pub vars: &'a mut VarContext,
    /// Loop for timers the action wants to wait on.
    pub event_loop: &'a EventLoop,
}

/// Signature of a tag handler: the host, the validated values and the engine services.
pub type ActionHandler<H> = fn(&mut H, &TagValues, &mut ActionContext<'_>) -> Result<ActionResult>;

/// A host-implemented command.
pub struct TagAction<H> {
    names: Vec<String>,
    params: Vec<ParamDef>,
    handler: ActionHandler<H>,
}

impl<H> fmt::Debug for TagAction<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagAction")
            .field("names", &self.names)
            .field("params", &self.params)
            .finish()
    }
}

impl<H> TagAction<H> {
    /// An action answering to every name in `names`.
    pub fn new(names: &[&str], handler: ActionHandler<H>) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            params: Vec::new(),
            handler,
        }
    }

    /// Declares a parameter. Declarations are checked in order.
    pub fn with_param(mut self, param: ParamDef) -> Self {
        self.params.push(param);
        self
    }

    /// Every tag name this action is registered under.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Declared parameters, in declaration order.
    pub fn params(&self) -> &[ParamDef] {
        &self.params
    }

    /// Applies defaults and checks presence and types. Undeclared values pass through.
    pub fn validate(&self, mut values: TagValues) -> Result<TagValues, ParameterError> {
        for def in &self.params {
            match values.get(&def.name) {
                Some(value) if !def.param_type.accepts(value) => {
                    return Err(ParameterError::TypeMismatch {
                        param: def.name.clone(),
                        expected: def.param_type,
                        found: type_name(value),
                    });
                }
                Some(_) => {}
                None if def.required => return Err(ParameterError::Missing(def.name.clone())),
                None => {
                    if let Some(default) = &def.default {
                        values.insert(def.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(values)
    }

    /// Runs the handler with values already passed through [`TagAction::validate`].
    pub fn call(
        &self,
        host: &mut H,
        values: &TagValues,
        context: &mut ActionContext<'_>,
    ) -> Result<ActionResult> {
        (self.handler)(host, values, context)
    }
}
