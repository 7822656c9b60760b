//! Shebang neutralization.
//!
//! Scripts that double as standalone executables start with a `#!` line.
//! The host turns that line into a comment before validation so neither the
//! parser nor the evaluator ever sees it. Line numbering is unchanged.

use std::borrow::Cow;

const SHEBANG: &str = "#!";

/// Returns `source` with a leading `#!` line rewritten as a line comment.
///
/// Everything after the first line is passed through untouched.
pub fn normalize(source: &str) -> Cow<'_, str> {
    let Some(rest) = source.strip_prefix(SHEBANG) else {
        return Cow::Borrowed(source);
    };
    // `// ` rather than `//` so a path like `/usr/bin/env` can't form `///`.
    let mut out = String::with_capacity(source.len() + 1);
    out.push_str("// ");
    out.push_str(rest);
    Cow::Owned(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
