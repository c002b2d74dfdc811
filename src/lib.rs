//! # novelscript
//!
//! A scripting engine for visual novels. Script text is parsed into a flat sequence of
//! [`models::Tag`]s by one of two grammar front-ends, walked by a [`core::script::Script`]
//! cursor that resolves labels, conditionals, loops and macros, and executed by the
//! [`core::conductor::Conductor`] against host-registered tag actions.

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
