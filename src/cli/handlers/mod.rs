// src/cli/handlers/mod.rs

//! One module per CLI command; each exposes `handle(args)`.

pub mod cache;
pub mod check;
pub mod commons;
pub mod parse;
pub mod run;
