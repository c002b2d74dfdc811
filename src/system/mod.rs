//! # System Interaction Layer
//!
//! Hosts that connect the engine to the outside world. The core never touches the
//! terminal; everything user-facing lives here.
//!
//! ## Modules
//!
//! - **`player`**: a terminal host implementing the presentation tags (`ch`,
//!   `__line_break__`, `l`, `p`, `wait`) on top of any `std::io::Write`.

pub mod player;
