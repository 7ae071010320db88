//! Interpreter dialects: launch arguments, handshake command and job envelope.
//!
//! A dialect knows how to make one particular interpreter speak the marker
//! protocol. Every envelope has the same shape:
//!
//! 1. emit `begin:<token>`
//! 2. evaluate the script
//! 3. if evaluation fails, print the error to stderr and emit `error:<token>`
//! 4. unconditionally emit `end:<token>`
//!
//! The script is spliced into a double-quoted string literal after escaping
//! `"` with a single backslash. This is deliberately minimal: a script that
//! contains a backslash right before a quote, or other sequences meaningful
//! to the interpreter's string syntax, can escape the envelope. Scripts are
//! trusted input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::token::Token;

/// How a specific interpreter is driven.
pub trait Dialect: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Fixed arguments selecting a non-interactive, batch, quiet mode.
    fn args(&self) -> Vec<String>;

    /// Command that makes the interpreter print `ready:<token>`.
    fn ready_command(&self, token: &Token) -> String;

    /// Wraps `script` in the guarded envelope for `token`.
    fn wrap(&self, script: &str, token: &Token) -> String;
}

/// Escapes double quotes with a single backslash.
pub fn escape_quotes(script: &str) -> String {
    script.replace('"', "\\\"")
}

/// GNU R, driven through `--vanilla --slave`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RDialect;

impl Dialect for RDialect {
    fn name(&self) -> &'static str {
        "r"
    }

    fn args(&self) -> Vec<String> {
        vec!["--vanilla".to_string(), "--slave".to_string()]
    }

    fn ready_command(&self, token: &Token) -> String {
        format!("cat(\"ready:{token}\");")
    }

    fn wrap(&self, script: &str, token: &Token) -> String {
        let script = escape_quotes(script);
        format!(
            "invisible(tryCatch({{ cat(\"begin:{token}\"); \
             .v <- withVisible(eval(parse(text=\"{script}\"))); \
             if (.v$visible) print(.v$value); }}, \
             error = function(e){{ message(conditionMessage(e)); cat(\"error:{token}\"); }}, \
             finally = {{ cat(\"end:{token}\"); }}));"
        )
    }
}

/// POSIX shell reading commands from stdin (`sh -s`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ShDialect;

impl Dialect for ShDialect {
    fn name(&self) -> &'static str {
        "sh"
    }

    fn args(&self) -> Vec<String> {
        vec!["-s".to_string()]
    }

    fn ready_command(&self, token: &Token) -> String {
        format!("printf 'ready:%s' '{token}'")
    }

    fn wrap(&self, script: &str, token: &Token) -> String {
        let script = escape_quotes(script);
        format!(
            "printf 'begin:%s' '{token}'; \
             eval \"{script}\" || {{ printf 'script exited with status %s\\n' \"$?\" >&2; printf 'error:%s' '{token}'; }}; \
             printf 'end:%s' '{token}'"
        )
    }
}

/// Selects a built-in dialect by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// GNU R.
    #[default]
    R,
    /// POSIX shell.
    Sh,
}

impl DialectKind {
    /// Returns the dialect implementation for this kind.
    pub fn dialect(&self) -> Box<dyn Dialect> {
        match self {
            DialectKind::R => Box::new(RDialect),
            DialectKind::Sh => Box::new(ShDialect),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialectKind::R => "r",
            DialectKind::Sh => "sh",
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "r" | "rscript" => Ok(DialectKind::R),
            "sh" | "shell" | "posix" => Ok(DialectKind::Sh),
            other => Err(format!("Unknown dialect: {}", other)),
        }
    }
}
