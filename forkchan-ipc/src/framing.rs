//! Whole-Value Framing
//!
//! Byte streams have no message boundaries and may accept or deliver fewer
//! bytes than requested in one call. These helpers loop until exactly the
//! agreed number of bytes has been moved, and classify early closure.

use crate::channel::ChannelError;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Maximum encoded frame size (16 MB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix of an encoded frame (u32, little-endian)
pub const FRAME_HEADER_LEN: usize = 4;

/// Write all of `bytes`, retrying short writes.
pub fn write_payload<W>(writer: &mut W, bytes: &[u8]) -> Result<(), ChannelError>
where
    W: Write + ?Sized,
{
    write_payload_with(writer, bytes, usize::MAX, || Ok(()))
}

/// Write all of `bytes`, at most `max_chunk` bytes per call, invoking `ready`
/// before every call.
///
/// `ready` is where transports block on a deadline; returning an error from it
/// aborts the transfer. A zero-length write or `EPIPE` means the peer is gone
/// and yields [`ChannelError::BrokenChannel`].
pub fn write_payload_with<W, F>(
    writer: &mut W,
    bytes: &[u8],
    max_chunk: usize,
    mut ready: F,
) -> Result<(), ChannelError>
where
    W: Write + ?Sized,
    F: FnMut() -> Result<(), ChannelError>,
{
    let expected = bytes.len();
    let max_chunk = max_chunk.max(1);
    let mut written = 0;

    while written < expected {
        ready()?;
        let end = expected.min(written.saturating_add(max_chunk));
        match writer.write(&bytes[written..end]) {
            Ok(0) => return Err(ChannelError::BrokenChannel { written, expected }),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                return Err(ChannelError::BrokenChannel { written, expected });
            }
            Err(e) => return Err(ChannelError::Io(e)),
        }
    }

    Ok(())
}

/// Fill `buf` completely, reassembling fragments.
pub fn read_payload<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError>
where
    R: Read + ?Sized,
{
    read_payload_with(reader, buf, || Ok(()))
}

/// Fill `buf` completely, invoking `ready` before every read.
///
/// End of stream before the buffer is full yields
/// [`ChannelError::ShortTransfer`]; the partially filled buffer must not be
/// handed to callers as a value.
pub fn read_payload_with<R, F>(reader: &mut R, buf: &mut [u8], mut ready: F) -> Result<(), ChannelError>
where
    R: Read + ?Sized,
    F: FnMut() -> Result<(), ChannelError>,
{
    let expected = buf.len();
    let mut received = 0;

    while received < expected {
        ready()?;
        match reader.read(&mut buf[received..]) {
            Ok(0) => return Err(ChannelError::ShortTransfer { received, expected }),
            Ok(n) => received += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChannelError::Io(e)),
        }
    }

    Ok(())
}

/// Serialize `value` into a length-prefixed frame
///
/// Frame format:
/// ```text
/// +----------------+------------------+
/// | length (4 LE)  | rkyv payload     |
/// +----------------+------------------+
/// ```
pub fn encode_frame<T>(value: &T) -> Result<Vec<u8>, ChannelError>
where
    T: Serialize<AllocSerializer<256>>,
{
    let bytes = rkyv::to_bytes::<_, 256>(value).map_err(|e| ChannelError::Encode(e.to_string()))?;
    let len = check_frame_len(bytes.len())?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

/// Validate a frame length read from (or about to be written to) the wire
pub fn check_frame_len(len: usize) -> Result<usize, ChannelError> {
    if len > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len == 0 {
        return Err(ChannelError::Decode("zero-length frame".to_string()));
    }
    Ok(len)
}

/// Validate and deserialize the body of a frame (without its length prefix)
pub fn decode_frame<T>(buf: &AlignedVec) -> Result<T, ChannelError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let archived =
        rkyv::check_archived_root::<T>(buf).map_err(|e| ChannelError::Decode(e.to_string()))?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|_| ChannelError::Decode("deserialization failed".to_string()))
}
