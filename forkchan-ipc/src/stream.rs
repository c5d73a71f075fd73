//! Stream-Backed Channels
//!
//! [`StreamChannel`] realizes [`Channel`] over one OS byte stream: an
//! anonymous pipe, or a Unix-domain socket pair used in a single fixed
//! direction. Role assignment closes the endpoint the role does not own, so
//! the peer observes end-of-stream as soon as the last writer goes away.

use crate::channel::{Channel, ChannelError, Role};
use crate::framing::{read_payload_with, write_payload_with};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Largest write issued while a send deadline is active. A pipe that polls
/// writable has room for at least one page, so writes of this size do not
/// block past the deadline.
const DEADLINE_WRITE_CHUNK: usize = 4096;

/// OS primitive backing a [`StreamChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Anonymous pipe (`pipe(2)`)
    #[default]
    Pipe,
    /// Unix-domain stream socket pair, used in one direction only
    SocketPair,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Pipe => f.write_str("pipe"),
            Transport::SocketPair => f.write_str("socket-pair"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pipe" => Ok(Transport::Pipe),
            "socket" | "socket-pair" | "socketpair" => Ok(Transport::SocketPair),
            other => Err(format!("Unknown transport: {}", other)),
        }
    }
}

/// Two transport handles created by one OS call
#[derive(Debug)]
pub struct EndpointPair {
    /// Handle the consumer reads from
    pub readable: OwnedFd,
    /// Handle the producer writes to
    pub writable: OwnedFd,
}

impl EndpointPair {
    /// Create an endpoint pair for `transport`
    pub fn open(transport: Transport) -> io::Result<Self> {
        match transport {
            Transport::Pipe => Self::pipe(),
            Transport::SocketPair => Self::socket_pair(),
        }
    }

    /// Create a pipe with both ends close-on-exec.
    pub fn pipe() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by nobody else.
        let (readable, writable) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        // A replaced program image must not inherit either end.
        set_cloexec(readable.as_raw_fd())?;
        set_cloexec(writable.as_raw_fd())?;

        Ok(Self { readable, writable })
    }

    /// Create a connected socket pair; the first socket reads, the second writes.
    pub fn socket_pair() -> io::Result<Self> {
        // std creates both sockets close-on-exec.
        let (reader, writer) = UnixStream::pair()?;
        Ok(Self {
            readable: OwnedFd::from(reader),
            writable: OwnedFd::from(writer),
        })
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Result of polling a descriptor
#[derive(Debug)]
enum PollResult {
    Ready,
    Timeout,
    Closed,
    Error(io::Error),
}

/// Wait until `fd` reports one of `events`, or `timeout` elapses
fn wait_for(fd: RawFd, events: libc::c_short, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32;

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & events != 0 {
        // Even if the peer is closing, there may be data left to drain
        PollResult::Ready
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::Closed
    } else {
        PollResult::Timeout
    }
}

/// Absolute deadline for one transfer
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Block until `fd` is ready for `events`. A closed peer counts as ready:
    /// the following read or write reports the closure precisely.
    fn wait(&self, fd: RawFd, events: libc::c_short) -> Result<(), ChannelError> {
        loop {
            let remaining = self.at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout(self.budget));
            }

            match wait_for(fd, events, remaining) {
                PollResult::Ready | PollResult::Closed => return Ok(()),
                PollResult::Timeout => continue,
                PollResult::Error(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                PollResult::Error(e) => return Err(ChannelError::Io(e)),
            }
        }
    }
}

/// Channel over a single OS byte stream.
///
/// One logical direction per instance: the producer writes, the consumer
/// reads. Exchanges in both directions need two instances bound oppositely
/// (see [`crate::Duplex`]).
#[derive(Debug)]
pub struct StreamChannel {
    transport: Transport,
    readable: Option<File>,
    writable: Option<File>,
    role: Role,
    finalized: bool,
}

impl StreamChannel {
    /// Create an unassigned channel over a fresh endpoint pair
    pub fn open(transport: Transport) -> Result<Self, ChannelError> {
        let endpoints = EndpointPair::open(transport)?;
        Ok(Self::from_endpoints(transport, endpoints))
    }

    /// Pipe-backed channel
    pub fn pipe() -> Result<Self, ChannelError> {
        Self::open(Transport::Pipe)
    }

    /// Socket-pair-backed channel
    pub fn socket_pair() -> Result<Self, ChannelError> {
        Self::open(Transport::SocketPair)
    }

    /// Wrap an existing endpoint pair
    pub fn from_endpoints(transport: Transport, endpoints: EndpointPair) -> Self {
        Self {
            transport,
            readable: Some(File::from(endpoints.readable)),
            writable: Some(File::from(endpoints.writable)),
            role: Role::Unassigned,
            finalized: false,
        }
    }

    /// Transport this channel was created with
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Whether any endpoint is still held
    pub fn is_open(&self) -> bool {
        self.readable.is_some() || self.writable.is_some()
    }

    /// Split an unassigned channel into a producer and a consumer inside the
    /// current process, for exchanges between threads.
    pub fn split(self) -> Result<(StreamChannel, StreamChannel), ChannelError> {
        if self.role != Role::Unassigned || self.finalized {
            return Err(ChannelError::InvalidState(format!(
                "only an unassigned channel can be split (role: {})",
                self.role
            )));
        }

        let StreamChannel {
            transport,
            readable,
            writable,
            ..
        } = self;

        let producer = StreamChannel {
            transport,
            readable: None,
            writable,
            role: Role::Producer,
            finalized: false,
        };
        let consumer = StreamChannel {
            transport,
            readable,
            writable: None,
            role: Role::Consumer,
            finalized: false,
        };
        Ok((producer, consumer))
    }
}

impl Channel for StreamChannel {
    fn initialize(&mut self, role: Role) -> Result<(), ChannelError> {
        if self.finalized {
            return Err(ChannelError::InvalidState(
                "channel already finalized".to_string(),
            ));
        }
        if role == Role::Unassigned {
            return Err(ChannelError::InvalidState(
                "cannot initialize a channel with the unassigned role".to_string(),
            ));
        }
        if self.role == role {
            return Ok(());
        }
        if self.role != Role::Unassigned {
            return Err(ChannelError::InvalidState(format!(
                "channel is bound to the {} role, cannot rebind to {}",
                self.role, role
            )));
        }

        // Dropping the File closes the descriptor
        match role {
            Role::Producer => self.readable = None,
            Role::Consumer | Role::Unassigned => self.writable = None,
        }
        self.role = role;

        debug!(transport = %self.transport, role = %role, "channel endpoint selected");
        Ok(())
    }

    fn role(&self) -> Role {
        self.role
    }

    fn send_bytes(&mut self, bytes: &[u8], timeout: Option<Duration>) -> Result<(), ChannelError> {
        if self.role != Role::Producer {
            return Err(ChannelError::InvalidState(format!(
                "send requires the producer role, channel is {}",
                self.role
            )));
        }
        let writer = self.writable.as_mut().ok_or_else(|| {
            ChannelError::InvalidState("writable endpoint already released".to_string())
        })?;

        trace!(len = bytes.len(), ?timeout, "sending payload");
        match timeout {
            None => write_payload_with(writer, bytes, usize::MAX, || Ok(())),
            Some(budget) => {
                let fd = writer.as_raw_fd();
                let deadline = Deadline::after(budget);
                write_payload_with(writer, bytes, DEADLINE_WRITE_CHUNK, || {
                    deadline.wait(fd, libc::POLLOUT)
                })
            }
        }
    }

    fn receive_bytes(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        if self.role != Role::Consumer {
            return Err(ChannelError::InvalidState(format!(
                "receive requires the consumer role, channel is {}",
                self.role
            )));
        }
        let reader = self.readable.as_mut().ok_or_else(|| {
            ChannelError::InvalidState("readable endpoint already released".to_string())
        })?;

        trace!(len = buf.len(), ?timeout, "receiving payload");
        match timeout {
            None => read_payload_with(reader, buf, || Ok(())),
            Some(budget) => {
                let fd = reader.as_raw_fd();
                let deadline = Deadline::after(budget);
                read_payload_with(reader, buf, || deadline.wait(fd, libc::POLLIN))
            }
        }
    }

    fn finalize(&mut self) -> Result<(), ChannelError> {
        if !self.finalized {
            debug!(transport = %self.transport, role = %self.role, "channel finalized");
        }
        self.readable = None;
        self.writable = None;
        self.finalized = true;
        Ok(())
    }
}
