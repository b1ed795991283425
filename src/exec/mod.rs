//! Process execution: launch contexts, supervised children and ordered
//! lifecycle chains.

pub mod context;
pub mod process;
pub mod sequencer;

pub use context::*;
pub use process::{ExitStatus, ProcessHandle, ProcessSpec, ProcessState, SupervisedProcess, SupervisionPolicy};
pub use sequencer::*;
