// src/core/mod.rs

//! # Engine Core
//!
//! Parsing, the script cursor, expression evaluation and the conductor.

pub mod async_task;
pub mod bracket_parser;
pub mod cache;
pub mod conductor;
pub mod config_loader;
pub mod expression;
pub mod frontend;
pub mod line_parser;
pub mod macros;
pub mod resource;
pub mod script;
pub mod tag_action;
pub mod variables;
