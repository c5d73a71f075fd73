//! Outcome Envelope
//!
//! The process handle never sends a bare payload: a fixed header tags the
//! transfer as a completed value or as a failure, so an error in the child is
//! reported to the parent instead of being lost when the child exits.
//!
//! Wire layout (fixed size, native endian):
//! ```text
//! +-------------+-------------+---------------------------+
//! | kind (u32)  | code (i32)  | payload (size_of::<T>())  |
//! +-------------+-------------+---------------------------+
//! ```
//! The payload bytes are zero when `kind` is a failure.
//!
//! Values live on the heap between the channel and the caller: a payload may
//! be far larger than a thread stack can hold in several copies.

use crate::channel::{Channel, ChannelError, Payload};
use std::fmt;
use std::mem::size_of;
use std::time::{Duration, Instant};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// `kind` value of a completed outcome
pub const OUTCOME_COMPLETED: u32 = 0;

/// Fixed header preceding the payload bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct OutcomeHeader {
    /// [`OUTCOME_COMPLETED`] or a [`FailureKind`] tag
    pub kind: u32,
    /// Failure detail, e.g. `errno` for [`FailureKind::ExecFailed`]
    pub code: i32,
}

impl OutcomeHeader {
    /// Header of a completed outcome
    pub fn completed() -> Self {
        Self {
            kind: OUTCOME_COMPLETED,
            code: 0,
        }
    }

    /// Header of a failed outcome
    pub fn failed(kind: FailureKind, code: i32) -> Self {
        Self {
            kind: kind.as_raw(),
            code,
        }
    }

    /// `None` for a completed outcome, the failure otherwise
    pub fn failure(&self) -> Result<Option<FailureKind>, ChannelError> {
        if self.kind == OUTCOME_COMPLETED {
            return Ok(None);
        }
        FailureKind::from_raw(self.kind)
            .map(Some)
            .ok_or_else(|| ChannelError::Decode(format!("unknown outcome tag {}", self.kind)))
    }
}

/// Categories of child failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FailureKind {
    /// The unit of work returned an error
    Error = 1,
    /// The unit of work panicked (caught)
    Panic = 2,
    /// Program image replacement failed
    ExecFailed = 3,
}

impl FailureKind {
    /// Wire tag of this kind
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Parse a wire tag; `None` for unknown tags
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(FailureKind::Error),
            2 => Some(FailureKind::Panic),
            3 => Some(FailureKind::ExecFailed),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error => f.write_str("error"),
            FailureKind::Panic => f.write_str("panic"),
            FailureKind::ExecFailed => f.write_str("exec failed"),
        }
    }
}

/// What the child reports back through the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The unit of work produced a value
    Completed(Box<T>),
    /// The unit of work did not produce a value
    Failed {
        /// Failure category
        kind: FailureKind,
        /// Failure detail
        code: i32,
    },
}

impl<T: Payload> Outcome<T> {
    /// Size of an outcome on the wire in bytes
    pub const WIRE_SIZE: usize = size_of::<OutcomeHeader>() + size_of::<T>();

    /// Header announcing this outcome
    pub fn header(&self) -> OutcomeHeader {
        match self {
            Outcome::Completed(_) => OutcomeHeader::completed(),
            Outcome::Failed { kind, code } => OutcomeHeader::failed(*kind, *code),
        }
    }

    /// Write the header, then exactly `size_of::<T>()` payload bytes
    pub fn send<C>(&self, channel: &mut C, timeout: Option<Duration>) -> Result<(), ChannelError>
    where
        C: Channel + ?Sized,
    {
        let start = Instant::now();
        channel.send_bytes(self.header().as_bytes(), timeout)?;
        let timeout = remaining(timeout, start);
        match self {
            Outcome::Completed(value) => channel.send_bytes(value.as_bytes(), timeout),
            Outcome::Failed { .. } => channel.send_bytes(&vec![0u8; size_of::<T>()], timeout),
        }
    }

    /// Read one outcome written by [`Outcome::send`].
    ///
    /// The payload is read straight into a zeroed heap allocation. A failure
    /// outcome still consumes its zero-filled payload bytes so the sender
    /// never blocks on a full transport.
    pub fn receive<C>(channel: &mut C, timeout: Option<Duration>) -> Result<Self, ChannelError>
    where
        C: Channel + ?Sized,
    {
        let start = Instant::now();
        let mut header = OutcomeHeader::new_zeroed();
        channel.receive_bytes(header.as_bytes_mut(), timeout)?;
        let failure = header.failure()?;

        let mut value = T::new_box_zeroed();
        channel.receive_bytes(value.as_bytes_mut(), remaining(timeout, start))?;

        Ok(match failure {
            None => Outcome::Completed(value),
            Some(kind) => Outcome::Failed {
                kind,
                code: header.code,
            },
        })
    }
}

fn remaining(timeout: Option<Duration>, start: Instant) -> Option<Duration> {
    timeout.map(|budget| budget.saturating_sub(start.elapsed()))
}
