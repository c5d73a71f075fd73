#![warn(missing_docs)]
//! forkchan IPC
//!
//! Single-shot, fixed-size payload channels between two cooperating processes.
//! A [`Channel`] is bound to one [`Role`] per process; the producer writes the
//! raw bytes of a [`Payload`] and the consumer reads exactly that many bytes
//! back. [`StreamChannel`] provides the pipe and socket-pair transports.

mod channel;
mod duplex;
mod framing;
mod messages;
mod stream;

pub use channel::{Channel, ChannelError, ChannelExt, Payload, Role};
pub use duplex::{Duplex, Side};
pub use framing::{
    FRAME_HEADER_LEN, MAX_FRAME_SIZE, check_frame_len, decode_frame, encode_frame, read_payload,
    read_payload_with, write_payload, write_payload_with,
};
pub use messages::{FailureKind, OUTCOME_COMPLETED, Outcome, OutcomeHeader};
pub use stream::{EndpointPair, StreamChannel, Transport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_bounds() {
        fn assert_payload<T: Payload>() {}
        assert_payload::<u8>();
        assert_payload::<i64>();
        assert_payload::<[u32; 1024]>();
        assert_payload::<OutcomeHeader>();
    }
}
