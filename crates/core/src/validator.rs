//! Static syntax validation.
//!
//! [`SyntaxValidator`] parses a script without evaluating it. It never
//! spawns threads or touches the output conduit, so a rejected submission
//! leaves no trace beyond the returned [`SyntaxError`].

use rhai::{Engine, ParseError, AST};

use crate::error::SyntaxError;

/// Parses script text into an [`AST`] ready for evaluation.
pub struct SyntaxValidator {
    engine: Engine,
}

impl SyntaxValidator {
    pub fn new() -> Self {
        Self {
            engine: Engine::new(),
        }
    }

    /// Parse `source`. The returned AST is handed to the worker as-is, so
    /// the script is parsed exactly once per job.
    pub fn validate(&self, source: &str) -> Result<AST, SyntaxError> {
        self.engine.compile(source).map_err(syntax_error)
    }
}

impl Default for SyntaxValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn syntax_error(err: ParseError) -> SyntaxError {
    let ParseError(kind, pos) = err;
    SyntaxError {
        line: pos.line().unwrap_or(0),
        message: kind.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
