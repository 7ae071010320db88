//! Correlation tokens for jobs and handshakes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Regex fragment matching the lexical shape of a token: 32 hex digits
/// grouped 8-4-4-4-12. Callers compile it case-insensitively.
pub const TOKEN_PATTERN: &str = "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

/// Length of a token in its canonical hyphenated form.
pub const TOKEN_LEN: usize = 36;

/// A unique identifier tying interpreter output back to a job or handshake.
///
/// Rendered as the 36-character lowercase hyphenated UUID form, which is the
/// form written into envelopes and matched in the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(Uuid);

impl Token {
    /// Generates a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for Token {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Token {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
