//! Channel Contract
//!
//! A channel moves one opaque, fixed-size value from a producer to a consumer.
//! Transports implement the byte-level [`Channel`] trait; the typed API lives
//! in [`ChannelExt`] so every transport gets it without extra code.

use crate::framing;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Binding of a channel instance to one direction of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Sends the payload
    Producer,
    /// Receives the payload
    Consumer,
    /// Not bound yet; only valid before `initialize`
    #[default]
    Unassigned,
}

impl Role {
    /// The role the peer holds on the same channel
    pub fn opposite(self) -> Role {
        match self {
            Role::Producer => Role::Consumer,
            Role::Consumer => Role::Producer,
            Role::Unassigned => Role::Unassigned,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
            Role::Unassigned => f.write_str("unassigned"),
        }
    }
}

/// Errors that can occur while moving a payload through a channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    #[error("Channel closed by peer after {written} of {expected} bytes were written")]
    BrokenChannel { written: usize, expected: usize },

    #[error("Channel closed by peer after {received} of {expected} bytes were received")]
    ShortTransfer { received: usize, expected: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A flat value that stays valid after a byte-for-byte copy into another
/// address space.
///
/// `AsBytes` rules out padding, references and pointers, `FromBytes` makes any
/// received bit pattern a valid value, and `Copy` rules out owned resources.
/// Strings and boxes cannot cross the fixed-size path; use
/// [`ChannelExt::send_encoded`] for those.
pub trait Payload: AsBytes + FromBytes + Copy + 'static {}

impl<T> Payload for T where T: AsBytes + FromBytes + Copy + 'static {}

/// Transport-agnostic contract for a single-direction byte channel.
///
/// Implementations must:
/// - keep only the endpoint matching the bound role after `initialize`,
/// - transfer whole buffers (`send_bytes` returns only once every byte was
///   accepted, `receive_bytes` only once the buffer is full),
/// - reject role misuse with [`ChannelError::InvalidState`] without blocking.
pub trait Channel: Send {
    /// Bind this instance to `role` and release the endpoint the role does not own
    fn initialize(&mut self, role: Role) -> Result<(), ChannelError>;

    /// Current role binding
    fn role(&self) -> Role;

    /// Write every byte of `bytes`, optionally bounded by `timeout`
    fn send_bytes(&mut self, bytes: &[u8], timeout: Option<Duration>)
    -> Result<(), ChannelError>;

    /// Fill `buf` completely, optionally bounded by `timeout`
    fn receive_bytes(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError>;

    /// Release every endpoint still held. Idempotent.
    fn finalize(&mut self) -> Result<(), ChannelError>;
}

/// Typed payload operations available on every [`Channel`]
pub trait ChannelExt: Channel {
    /// Send the raw bytes of `value`
    fn send<T: Payload>(&mut self, value: &T) -> Result<(), ChannelError> {
        self.send_bytes(value.as_bytes(), None)
    }

    /// Send the raw bytes of `value`, failing with `Timeout` if the transport
    /// does not accept them within `timeout`
    fn send_timeout<T: Payload>(&mut self, value: &T, timeout: Duration) -> Result<(), ChannelError> {
        self.send_bytes(value.as_bytes(), Some(timeout))
    }

    /// Block until a complete `T` has arrived
    fn receive<T: Payload>(&mut self) -> Result<T, ChannelError> {
        self.receive_within(None)
    }

    /// Wait at most `timeout` for a complete `T`
    fn receive_timeout<T: Payload>(&mut self, timeout: Duration) -> Result<T, ChannelError> {
        self.receive_within(Some(timeout))
    }

    /// Receive a complete `T` with an optional deadline
    fn receive_within<T: Payload>(&mut self, timeout: Option<Duration>) -> Result<T, ChannelError> {
        let mut value = T::new_zeroed();
        self.receive_bytes(value.as_bytes_mut(), timeout)?;
        Ok(value)
    }

    /// Send a non-flat value as a length-prefixed rkyv frame
    fn send_encoded<T>(&mut self, value: &T) -> Result<(), ChannelError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        let frame = framing::encode_frame(value)?;
        self.send_bytes(&frame, None)
    }

    /// Receive a value sent with [`ChannelExt::send_encoded`]
    fn receive_encoded<T>(&mut self) -> Result<T, ChannelError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        let mut len_buf = [0u8; framing::FRAME_HEADER_LEN];
        self.receive_bytes(&mut len_buf, None)?;
        let len = framing::check_frame_len(u32::from_le_bytes(len_buf) as usize)?;

        let mut buf = rkyv::AlignedVec::with_capacity(len);
        buf.resize(len, 0);
        self.receive_bytes(&mut buf, None)?;

        framing::decode_frame(&buf)
    }
}

impl<C: Channel + ?Sized> ChannelExt for C {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamChannel;

    #[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
    #[repr(C)]
    struct Reading {
        sensor: u32,
        flags: u32,
        value: f64,
    }

    fn pair() -> (StreamChannel, StreamChannel) {
        StreamChannel::pipe().unwrap().split().unwrap()
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(Role::Producer.opposite(), Role::Consumer);
        assert_eq!(Role::Consumer.opposite(), Role::Producer);
        assert_eq!(Role::Unassigned.opposite(), Role::Unassigned);
        assert_eq!(Role::default(), Role::Unassigned);
    }

    #[test]
    fn test_typed_round_trip() {
        let (mut producer, mut consumer) = pair();
        let reading = Reading {
            sensor: 7,
            flags: 0b101,
            value: -3.25,
        };

        producer.send(&reading).unwrap();
        let received: Reading = consumer.receive().unwrap();
        assert_eq!(received, reading);
    }

    #[test]
    fn test_send_on_consumer_is_invalid() {
        let (_producer, mut consumer) = pair();
        let result = consumer.send(&42u32);
        assert!(matches!(result, Err(ChannelError::InvalidState(_))));
    }

    #[test]
    fn test_receive_on_producer_is_invalid() {
        let (mut producer, _consumer) = pair();
        let result: Result<u32, _> = producer.receive();
        assert!(matches!(result, Err(ChannelError::InvalidState(_))));
    }

    #[test]
    fn test_unassigned_channel_rejects_transfers() {
        let mut channel = StreamChannel::pipe().unwrap();
        assert!(matches!(
            channel.send(&1u8),
            Err(ChannelError::InvalidState(_))
        ));
        assert!(matches!(
            channel.receive::<u8>(),
            Err(ChannelError::InvalidState(_))
        ));
    }

    #[test]
    fn test_receive_timeout_elapses() {
        let (_producer, mut consumer) = pair();
        let result: Result<u64, _> = consumer.receive_timeout(Duration::from_millis(50));
        assert!(matches!(result, Err(ChannelError::Timeout(_))));
    }

    #[test]
    fn test_encoded_string_round_trip() {
        let (mut producer, mut consumer) = pair();
        producer.send_encoded(&"not a flat value".to_string()).unwrap();
        let text: String = consumer.receive_encoded().unwrap();
        assert_eq!(text, "not a flat value");
    }

    #[test]
    fn test_dyn_channel_uses_typed_api() {
        let (producer, consumer) = pair();
        let mut producer: Box<dyn Channel> = Box::new(producer);
        let mut consumer: Box<dyn Channel> = Box::new(consumer);

        producer.send(&0xdead_beef_u32).unwrap();
        assert_eq!(consumer.receive::<u32>().unwrap(), 0xdead_beef);
    }
}
