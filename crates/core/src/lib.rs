//! `mdscript-core` -- script execution host.
//!
//! Accepts user-authored Rhai scripts, validates them, runs them on a
//! dedicated worker thread against an immutable capability table, streams
//! whatever they print, and supports cooperative abort and an interactive
//! stepping debugger. The console front end lives in `mdscript-runner`.

pub mod capability;
pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod host;
pub mod job;
pub mod output;
pub mod shebang;
pub mod validator;
pub mod worker;

pub use capability::{Binding, CapabilityError, CapabilitySet};
pub use config::{CaptureMode, ConfigError, HostConfig};
pub use debug::{DebugEvent, DebugHandle, DebugOptions, PauseReason};
pub use error::{HostError, ScriptFailure, SyntaxError};
pub use events::{JobEvent, JobEvents, JobResult, OutputChunk};
pub use host::{HostMode, ScriptHost};
pub use job::{JobId, JobOutcome, JobStatus};
