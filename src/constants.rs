// src/constants.rs

//! Tag names, file names and defaults shared across the engine.

/// The name of the engine configuration file, looked up in the working directory.
pub const CONFIG_FILENAME: &str = "novelscript.toml";

/// The default directory (relative to the config file) that holds script files.
pub const DEFAULT_SCRIPTS_DIR: &str = "scenario";

/// The default entry script played by `novelscript run` when no file is given.
pub const DEFAULT_FIRST_SCRIPT: &str = "start.pon";

/// The default file (relative to the config file) where the `sv` namespace is persisted.
pub const DEFAULT_SYSTEM_FILE: &str = "system.json";

/// The file extension of compiled tag caches.
pub const CACHE_FILE_EXTENSION: &str = "tags.bin";

/// Script files with this extension are always read with the bracket grammar.
pub const BRACKET_GRAMMAR_EXTENSION: &str = "ks";

/// Extensions recognised as script files when scanning the scripts directory.
pub const SCRIPT_EXTENSIONS: &[&str] = &["pon", BRACKET_GRAMMAR_EXTENSION];

/// Default limit for nested macro frames, guarding against runaway recursion.
pub const DEFAULT_MAX_MACRO_DEPTH: usize = 64;

/// `tv` variable a `for` loop counts in when the tag names none.
pub const DEFAULT_INDEX_VAR: &str = "__index__";

/// Prefix marking a string parameter as an expression evaluated at dispatch time.
pub const DEFERRED_EXPRESSION_PREFIX: char = '&';

/// Synthetic key holding the raw source text of every tag.
pub const BODY_KEY: &str = "__body__";

// --- RESERVED TAG NAMES ---

/// Emitted for `*name` lines.
pub const TAG_LABEL: &str = "__label__";
/// Emitted for `~name|comment` lines.
pub const TAG_SAVE_MARK: &str = "__save_mark__";
/// Emitted for inline (`-`, `=`) and block (`---`) script expressions.
pub const TAG_JS: &str = "__js__";
/// Emitted at the end of every text line and for blank lines.
pub const TAG_LINE_BREAK: &str = "__line_break__";
/// One character of literal text.
pub const TAG_CH: &str = "ch";
/// Terminal sentinel appended to every parsed script.
pub const TAG_STOP: &str = "s";

// --- CONTROL TAG NAMES (handled by the conductor) ---

/// Opens a conditional block; `exp` is the condition.
pub const TAG_IF: &str = "if";
/// Alternative branch of an `if` block.
pub const TAG_ELSIF: &str = "elsif";
/// Fallback branch of an `if` block.
pub const TAG_ELSE: &str = "else";
/// Closes an `if` block.
pub const TAG_ENDIF: &str = "endif";
/// Opens a loop; `loops` iterations, index in `tv.<indexvar>`.
pub const TAG_FOR: &str = "for";
/// Closes a loop body.
pub const TAG_ENDFOR: &str = "endfor";
/// Leaves the innermost loop.
pub const TAG_BREAKFOR: &str = "breakfor";
/// Starts a macro definition named by `name`.
pub const TAG_MACRO: &str = "macro";
/// Ends a macro definition.
pub const TAG_ENDMACRO: &str = "endmacro";
/// Moves execution to a label, save-mark or file.
pub const TAG_JUMP: &str = "jump";
/// Like `jump`, but `return` comes back to the caller.
pub const TAG_CALL: &str = "call";
/// Returns to the tag after the last `call`.
pub const TAG_RETURN: &str = "return";

/// Every tag name that user macros may not shadow.
pub const RESERVED_TAG_NAMES: &[&str] = &[
    TAG_LABEL,
    TAG_SAVE_MARK,
    TAG_JS,
    TAG_LINE_BREAK,
    TAG_CH,
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
];
