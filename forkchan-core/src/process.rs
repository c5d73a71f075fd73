//! Process Handle
//!
//! Duplicates the current process, runs a unit of work in the child and hands
//! its result to the parent through a [`Channel`].
//!
//! ```text
//!            run()
//! Unforked ─────────┬──► ParentSide ──wait()──► Terminated
//!                   │
//!                   └──► ChildSide ──replace_program_image()──► ProgramReplaced
//!                            │
//!                            └── send outcome, _exit
//! ```
//!
//! After `fork` each process keeps its own copy of the handle and its own
//! channel instance. The child binds the producer role, the parent the
//! consumer role; the child never returns from `run()`.

use crate::exec::ProgramImage;
use forkchan_ipc::{
    Channel, ChannelError, FailureKind, Outcome, Payload, Role, StreamChannel, Transport,
};
use std::convert::Infallible;
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Child exit status after the result was sent
pub const EXIT_SUCCESS: i32 = 0;
/// Child exit status after a failure outcome was sent
pub const EXIT_WORK_FAILED: i32 = 1;
/// Child exit status when the channel itself failed
pub const EXIT_CHANNEL_FAILED: i32 = 2;
/// Child exit status when program image replacement failed
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Errors that can occur while running a child process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to duplicate process: {0}")]
    DuplicationFailed(#[source] io::Error),

    #[error("Invalid process state: {0}")]
    InvalidState(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Child reported failure: {kind} (code {code})")]
    ChildFailed { kind: FailureKind, code: i32 },

    #[error("Failed to replace program image: {0}")]
    ExecFailed(#[source] io::Error),

    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

impl ProcessError {
    /// Role or lifecycle misuse, on the handle or on its channel
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            ProcessError::InvalidState(_) | ProcessError::Channel(ChannelError::InvalidState(_))
        )
    }

    /// The receive deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Channel(ChannelError::Timeout(_)))
    }

    /// The child closed the channel before a full result arrived
    pub fn is_short_transfer(&self) -> bool {
        matches!(
            self,
            ProcessError::Channel(ChannelError::ShortTransfer { .. })
        )
    }
}

/// Identifier of the duplicated process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildId(libc::pid_t);

impl ChildId {
    /// Raw OS process id
    pub fn as_raw(self) -> libc::pid_t {
        self.0
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Exited with a status code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl ChildExit {
    /// Exited with status 0
    pub fn success(self) -> bool {
        self == ChildExit::Exited(EXIT_SUCCESS)
    }

    /// Exit code, if the child exited normally
    pub fn code(self) -> Option<i32> {
        match self {
            ChildExit::Exited(code) => Some(code),
            ChildExit::Signaled(_) => None,
        }
    }

    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            ChildExit::Exited(libc::WEXITSTATUS(status))
        } else {
            ChildExit::Signaled(libc::WTERMSIG(status))
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exited with status {}", code),
            ChildExit::Signaled(signal) => write!(f, "killed by signal {}", signal),
        }
    }
}

/// Lifecycle position of a [`ProcessHandle`] in the current process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// `run()` not called yet
    Unforked,
    /// Parent process, child running
    ParentSide,
    /// Duplicated process, executing the unit of work
    ChildSide,
    /// Duplicated process, about to become another program
    ProgramReplaced,
    /// Parent process, child reaped
    Terminated,
}

/// Orchestrates one child process and its single result of type `T`
pub struct ProcessHandle<T: Payload> {
    channel: Box<dyn Channel>,
    state: ProcessState,
    role: Role,
    child: Option<ChildId>,
    exit: Option<ChildExit>,
    timeout: Option<Duration>,
    transferred: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Payload> ProcessHandle<T> {
    /// Handle with a pipe-backed channel
    pub fn new() -> Result<Self, ProcessError> {
        Self::with_transport(Transport::Pipe)
    }

    /// Handle with a [`StreamChannel`] on `transport`
    pub fn with_transport(transport: Transport) -> Result<Self, ProcessError> {
        let channel = StreamChannel::open(transport)?;
        Ok(Self::with_channel(Box::new(channel)))
    }

    /// Handle over a caller-provided, unassigned channel
    pub fn with_channel(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            state: ProcessState::Unforked,
            role: Role::Unassigned,
            child: None,
            exit: None,
            timeout: None,
            transferred: false,
            _payload: PhantomData,
        }
    }

    /// Bound the parent's wait in [`ProcessHandle::receive_result`] by `timeout`.
    ///
    /// The child's send is never timed: the parent may collect the result long
    /// after the child finished its work.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Change or clear the receive deadline
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Identifier of the child, once duplicated
    pub fn child_id(&self) -> Option<ChildId> {
        self.child
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Role of this handle's channel
    pub fn role(&self) -> Role {
        self.role
    }

    /// Run `work` in a duplicated process.
    ///
    /// Returns in the parent as soon as the child exists; fetch the value with
    /// [`ProcessHandle::receive_result`].
    pub fn run<F>(&mut self, work: F) -> Result<ChildId, ProcessError>
    where
        F: FnOnce() -> T,
    {
        self.try_run_with(move |_| Ok::<T, Infallible>(work()))
    }

    /// Run a fallible `work` in a duplicated process.
    ///
    /// An `Err` or a panic in the child reaches the parent as
    /// [`ProcessError::ChildFailed`].
    pub fn try_run<F, E>(&mut self, work: F) -> Result<ChildId, ProcessError>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Display,
    {
        self.try_run_with(move |_| work())
    }

    /// Run a fallible `work` that receives the child side of the handle.
    ///
    /// Through [`ChildContext`] the work may replace the child's program
    /// image instead of producing a value. If that replacement fails and the
    /// work returns the error, the parent sees [`FailureKind::ExecFailed`].
    pub fn try_run_with<F, E>(&mut self, work: F) -> Result<ChildId, ProcessError>
    where
        F: FnOnce(&mut ChildContext<'_, T>) -> Result<T, E>,
        E: fmt::Display,
    {
        self.duplicate(move |handle| handle.complete_child(work))
    }

    /// Duplicate the process and replace the child's image with `path`.
    ///
    /// The new program knows nothing of the channel, so the parent's
    /// `receive_result` ends with a short transfer unless `execv` fails, in
    /// which case it reports [`FailureKind::ExecFailed`] with the `errno`.
    pub fn run_program<P, S>(&mut self, path: P, args: &[S]) -> Result<ChildId, ProcessError>
    where
        P: AsRef<Path>,
        S: AsRef<OsStr>,
    {
        let image = ProgramImage::new(path, args)?;
        self.duplicate(move |handle| handle.exec_child(&image))
    }

    /// Replace the current (child) process image. Only valid on the child side
    /// before the result was sent; on success the call does not return and the
    /// channel is gone with the old image.
    ///
    /// A unit of work reaches the child side through
    /// [`ChildContext::replace_program_image`]; elsewhere this fails with
    /// `InvalidState`.
    pub fn replace_program_image<P, S>(
        &mut self,
        path: P,
        args: &[S],
    ) -> Result<Infallible, ProcessError>
    where
        P: AsRef<Path>,
        S: AsRef<OsStr>,
    {
        self.ensure_replaceable()?;
        let image = ProgramImage::new(path, args)?;
        self.replace_with(&image)
    }

    /// Block until the child's result arrives. Single-shot: a second call fails
    /// with `InvalidState`.
    pub fn receive_result(&mut self) -> Result<T, ProcessError> {
        self.receive_boxed().map(|value| *value)
    }

    /// [`ProcessHandle::receive_result`], leaving the value on the heap
    pub fn receive_boxed(&mut self) -> Result<Box<T>, ProcessError> {
        match self.state {
            ProcessState::ParentSide | ProcessState::Terminated => {}
            state => {
                return Err(ProcessError::InvalidState(format!(
                    "result can only be received by the parent (state: {:?})",
                    state
                )));
            }
        }
        if self.transferred {
            return Err(ProcessError::InvalidState(
                "result already received".to_string(),
            ));
        }
        self.transferred = true;

        let received = Outcome::<T>::receive(&mut *self.channel, self.timeout);
        self.channel.finalize()?;

        match received? {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed { kind, code } => Err(ProcessError::ChildFailed { kind, code }),
        }
    }

    /// Block until the child terminates. Repeated calls return the cached status.
    pub fn wait(&mut self) -> Result<ChildExit, ProcessError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let child = match (self.state, self.child) {
            (ProcessState::ParentSide, Some(child)) => child,
            (state, _) => {
                return Err(ProcessError::InvalidState(format!(
                    "only the parent can wait for the child (state: {:?})",
                    state
                )));
            }
        };

        let mut status: libc::c_int = 0;
        loop {
            let ret = unsafe { libc::waitpid(child.0, &mut status, 0) };
            if ret == child.0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ProcessError::Wait(err));
        }

        let exit = ChildExit::from_wait_status(status);
        debug!(child = %child, %exit, "child reaped");
        self.exit = Some(exit);
        self.state = ProcessState::Terminated;
        Ok(exit)
    }

    fn duplicate<C>(&mut self, continuation: C) -> Result<ChildId, ProcessError>
    where
        C: FnOnce(&mut Self) -> i32,
    {
        if self.state != ProcessState::Unforked {
            return Err(ProcessError::InvalidState(format!(
                "run() may only be called once per handle (state: {:?})",
                self.state
            )));
        }

        match unsafe { libc::fork() } {
            -1 => Err(ProcessError::DuplicationFailed(io::Error::last_os_error())),
            0 => {
                self.state = ProcessState::ChildSide;
                self.role = Role::Producer;
                // Never unwind into the caller's frames: they belong to the parent's logic.
                let status = panic::catch_unwind(AssertUnwindSafe(|| continuation(self)))
                    .unwrap_or(EXIT_CHANNEL_FAILED);
                // SAFETY: _exit ends the child without running destructors or
                // atexit handlers duplicated from the parent.
                unsafe { libc::_exit(status) }
            }
            pid => {
                let child = ChildId(pid);
                self.state = ProcessState::ParentSide;
                self.role = Role::Consumer;
                self.child = Some(child);
                debug!(child = %child, "process duplicated");
                self.channel.initialize(Role::Consumer)?;
                Ok(child)
            }
        }
    }

    fn complete_child<F, E>(&mut self, work: F) -> i32
    where
        F: FnOnce(&mut ChildContext<'_, T>) -> Result<T, E>,
        E: fmt::Display,
    {
        if let Err(e) = self.channel.initialize(Role::Producer) {
            warn!(error = %e, "child could not bind the producer endpoint");
            return EXIT_CHANNEL_FAILED;
        }

        let mut context = ChildContext {
            handle: self,
            exec_failure: None,
        };
        let result =
            panic::catch_unwind(AssertUnwindSafe(|| work(&mut context).map(Box::new)));
        let exec_failure = context.exec_failure;

        let (outcome, status) = match result {
            Ok(Ok(value)) => (Outcome::Completed(value), EXIT_SUCCESS),
            Ok(Err(e)) => {
                warn!(error = %e, "unit of work failed");
                match exec_failure {
                    Some(code) => (
                        Outcome::Failed {
                            kind: FailureKind::ExecFailed,
                            code,
                        },
                        EXIT_EXEC_FAILED,
                    ),
                    None => (
                        Outcome::Failed {
                            kind: FailureKind::Error,
                            code: 0,
                        },
                        EXIT_WORK_FAILED,
                    ),
                }
            }
            Err(_) => (
                Outcome::Failed {
                    kind: FailureKind::Panic,
                    code: 0,
                },
                EXIT_WORK_FAILED,
            ),
        };
        match self.send_outcome(&outcome) {
            Ok(()) => status,
            Err(e) => {
                warn!(error = %e, "child could not send its result");
                EXIT_CHANNEL_FAILED
            }
        }
    }

    fn exec_child(&mut self, image: &ProgramImage) -> i32 {
        if let Err(e) = self.channel.initialize(Role::Producer) {
            warn!(error = %e, "child could not bind the producer endpoint");
            return EXIT_CHANNEL_FAILED;
        }

        let err = match self.replace_with(image) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        let code = exec_errno(&err);
        warn!(error = %err, path = ?image.path(), "program image replacement failed");

        let failure = Outcome::Failed {
            kind: FailureKind::ExecFailed,
            code,
        };
        if let Err(e) = self.send_outcome(&failure) {
            warn!(error = %e, "child could not report the exec failure");
        }
        EXIT_EXEC_FAILED
    }

    // Untimed: the parent decides when to collect the result.
    fn send_outcome(&mut self, outcome: &Outcome<T>) -> Result<(), ProcessError> {
        outcome.send(&mut *self.channel, None)?;
        self.transferred = true;
        self.channel.finalize()?;
        Ok(())
    }

    fn ensure_replaceable(&self) -> Result<(), ProcessError> {
        if self.state != ProcessState::ChildSide {
            return Err(ProcessError::InvalidState(format!(
                "program image can only be replaced in the child (state: {:?})",
                self.state
            )));
        }
        if self.transferred {
            return Err(ProcessError::InvalidState(
                "result already sent".to_string(),
            ));
        }
        Ok(())
    }

    fn replace_with(&mut self, image: &ProgramImage) -> Result<Infallible, ProcessError> {
        self.ensure_replaceable()?;
        self.state = ProcessState::ProgramReplaced;
        let err = image.exec();
        self.state = ProcessState::ChildSide;
        Err(ProcessError::ExecFailed(err))
    }
}

fn exec_errno(err: &ProcessError) -> i32 {
    match err {
        ProcessError::ExecFailed(e) => e.raw_os_error().unwrap_or(0),
        _ => 0,
    }
}

/// Child side of a [`ProcessHandle`], handed to the unit of work by
/// [`ProcessHandle::try_run_with`]
pub struct ChildContext<'a, T: Payload> {
    handle: &'a mut ProcessHandle<T>,
    exec_failure: Option<i32>,
}

impl<T: Payload> ChildContext<'_, T> {
    /// Lifecycle state of the handle in the child
    pub fn state(&self) -> ProcessState {
        self.handle.state
    }

    /// Replace the child's program image with `path`.
    ///
    /// Does not return on success. On failure the error comes back to the
    /// work; returning it reports [`FailureKind::ExecFailed`] to the parent.
    pub fn replace_program_image<P, S>(
        &mut self,
        path: P,
        args: &[S],
    ) -> Result<Infallible, ProcessError>
    where
        P: AsRef<Path>,
        S: AsRef<OsStr>,
    {
        let result = self.handle.replace_program_image(path, args);
        if let Err(err) = &result {
            if matches!(err, ProcessError::ExecFailed(_)) {
                self.exec_failure = Some(exec_errno(err));
            }
        }
        result
    }
}

impl<T: Payload> fmt::Debug for ChildContext<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildContext")
            .field("state", &self.handle.state)
            .field("exec_failure", &self.exec_failure)
            .finish()
    }
}

impl<T: Payload> fmt::Debug for ProcessHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("child", &self.child)
            .field("exit", &self.exit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Payload> Drop for ProcessHandle<T> {
    fn drop(&mut self) {
        let _ = self.channel.finalize();

        // Reap an already-exited child so it does not linger as a zombie
        if let (ProcessState::ParentSide, Some(child)) = (self.state, self.child) {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(child.0, &mut status, libc::WNOHANG) };
            if ret == 0 {
                debug!(child = %child, "child still running at drop");
            }
        }
    }
}
