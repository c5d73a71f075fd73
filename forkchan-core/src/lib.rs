#![warn(missing_docs)]
//! forkchan Core - Process Orchestration
//!
//! This crate provides the process side of forkchan:
//! - `ProcessHandle` duplicates the current process and runs a unit of work in the child
//! - The child binds the producer end of the channel, the parent the consumer end
//! - Child failures (errors, panics, failed program replacement) travel back as tagged outcomes
//! - `ProgramImage` prepares `execv` arguments before the process is duplicated

mod exec;
mod process;

pub use exec::ProgramImage;
pub use process::{
    ChildContext, ChildExit, ChildId, EXIT_CHANNEL_FAILED, EXIT_EXEC_FAILED, EXIT_SUCCESS,
    EXIT_WORK_FAILED, ProcessError, ProcessHandle, ProcessState,
};
