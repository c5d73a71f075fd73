#![warn(missing_docs)]
//! # forkchan
//!
//! Fork a child process, let it compute a value, and hand that value back to
//! the parent over a one-shot channel.
//!
//! - **Typed payloads**: any plain-data type implementing zerocopy's `AsBytes + FromBytes`
//! - **Strict roles**: the child produces, the parent consumes, and nothing is sent twice
//! - **Failure reporting**: child errors, panics and failed `execv` reach the parent as errors
//! - **Transports**: anonymous pipes or Unix-domain socket pairs
//!
//! ## Quick Start
//!
//! ```ignore
//! use forkchan::prelude::*;
//!
//! let mut handle = ProcessHandle::<u64>::new()?;
//! handle.run(|| 6 * 7)?;
//! assert_eq!(handle.receive_result()?, 42);
//! handle.wait()?;
//! ```
//!
//! ## Replacing the Child
//!
//! ```ignore
//! let mut handle = ProcessHandle::<()>::new()?;
//! handle.run_program("/bin/sh", &["-c", "exit 0"])?;
//! let exit = handle.wait()?;
//! ```

// Re-export channel types
pub use forkchan_ipc::{
    Channel, ChannelError, ChannelExt, Duplex, EndpointPair, FailureKind, Outcome, Payload, Role,
    Side, StreamChannel, Transport,
};

// Re-export process types
pub use forkchan_core::{
    ChildContext, ChildExit, ChildId, EXIT_CHANNEL_FAILED, EXIT_EXEC_FAILED, EXIT_SUCCESS,
    EXIT_WORK_FAILED, ProcessError, ProcessHandle, ProcessState, ProgramImage,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Channel, ChannelError, ChannelExt, ChildExit, Payload, ProcessError, ProcessHandle, Role,
        StreamChannel, Transport,
    };
}

/// Run the forkchan CLI.
///
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     forkchan::run()
/// }
/// ```
pub use forkchan_cli::run;
