//! Request/Response over Two Channels
//!
//! A single endpoint pair carries one direction only. Duplex exchange uses two
//! pairs bound oppositely: the requester produces on `request` and consumes on
//! `response`, the responder does the reverse.

use crate::channel::{Channel, ChannelError, Role};
use crate::stream::{StreamChannel, Transport};
use std::fmt;

/// Which end of a duplex exchange this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Sends requests, receives responses
    Requester,
    /// Receives requests, sends responses
    Responder,
}

impl Side {
    fn request_role(self) -> Role {
        match self {
            Side::Requester => Role::Producer,
            Side::Responder => Role::Consumer,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Requester => f.write_str("requester"),
            Side::Responder => f.write_str("responder"),
        }
    }
}

/// Two independent channels, one per direction
#[derive(Debug)]
pub struct Duplex<C = StreamChannel> {
    request: C,
    response: C,
    side: Option<Side>,
}

impl Duplex<StreamChannel> {
    /// Create both endpoint pairs on `transport`
    pub fn open(transport: Transport) -> Result<Self, ChannelError> {
        Ok(Self::new(
            StreamChannel::open(transport)?,
            StreamChannel::open(transport)?,
        ))
    }

    /// Split into requester and responder inside the current process
    pub fn split(self) -> Result<(Self, Self), ChannelError> {
        if self.side.is_some() {
            return Err(ChannelError::InvalidState(
                "only an unassigned duplex can be split".to_string(),
            ));
        }
        let (request_tx, request_rx) = self.request.split()?;
        let (response_tx, response_rx) = self.response.split()?;

        let requester = Duplex {
            request: request_tx,
            response: response_rx,
            side: Some(Side::Requester),
        };
        let responder = Duplex {
            request: request_rx,
            response: response_tx,
            side: Some(Side::Responder),
        };
        Ok((requester, responder))
    }
}

impl<C: Channel> Duplex<C> {
    /// Pair two unassigned channels
    pub fn new(request: C, response: C) -> Self {
        Self {
            request,
            response,
            side: None,
        }
    }

    /// Bind both channels for `side`
    pub fn initialize(&mut self, side: Side) -> Result<(), ChannelError> {
        if let Some(current) = self.side {
            if current != side {
                return Err(ChannelError::InvalidState(format!(
                    "duplex is bound as {}, cannot rebind as {}",
                    current, side
                )));
            }
        }
        let request_role = side.request_role();
        self.request.initialize(request_role)?;
        self.response.initialize(request_role.opposite())?;
        self.side = Some(side);
        Ok(())
    }

    /// Side this duplex is bound to
    pub fn side(&self) -> Option<Side> {
        self.side
    }

    /// Channel this side produces on
    pub fn outbound(&mut self) -> Result<&mut C, ChannelError> {
        match self.side {
            Some(Side::Requester) => Ok(&mut self.request),
            Some(Side::Responder) => Ok(&mut self.response),
            None => Err(ChannelError::InvalidState(
                "duplex side not assigned".to_string(),
            )),
        }
    }

    /// Channel this side consumes from
    pub fn inbound(&mut self) -> Result<&mut C, ChannelError> {
        match self.side {
            Some(Side::Requester) => Ok(&mut self.response),
            Some(Side::Responder) => Ok(&mut self.request),
            None => Err(ChannelError::InvalidState(
                "duplex side not assigned".to_string(),
            )),
        }
    }

    /// Release all four endpoints still held. Idempotent.
    pub fn finalize(&mut self) -> Result<(), ChannelError> {
        self.request.finalize()?;
        self.response.finalize()
    }
}
