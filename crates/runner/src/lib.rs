//! `mdscript-runner` -- console front end for the script host.
//!
//! Provides the demo molecular capability table and the streaming console
//! loop used by the `mdscript` binary.

pub mod capabilities;
pub mod console;
