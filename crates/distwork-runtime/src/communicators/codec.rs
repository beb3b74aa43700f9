//! Length-prefixed wire codec for TCP peer links
//!
//! Each message is a 4-byte big-endian body length followed by the
//! `bincode` encoding of its frame list.

use distwork_core::{Frame, Message, TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX: usize = 4;

fn check_size(size: usize, max_size: usize) -> TransportResult<()> {
    if size > max_size || size > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge { size, max_size });
    }
    Ok(())
}

/// Encode a message into a complete wire frame
pub fn encode(message: &Message, max_size: usize) -> TransportResult<Vec<u8>> {
    let body = bincode::serialize(message.frames())?;
    check_size(body.len(), max_size)?;

    let mut wire = Vec::with_capacity(LENGTH_PREFIX + body.len());
    wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
    wire.extend_from_slice(&body);
    Ok(wire)
}

/// Decode one message from the front of `buf`
///
/// Returns `None` until a complete frame is buffered, otherwise the message
/// and the number of bytes it consumed.
pub fn decode(buf: &[u8], max_size: usize) -> TransportResult<Option<(Message, usize)>> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX) else {
        return Ok(None);
    };
    let size = body_length(prefix);
    check_size(size, max_size)?;

    let Some(body) = buf.get(LENGTH_PREFIX..LENGTH_PREFIX + size) else {
        return Ok(None);
    };
    Ok(Some((decode_body(body)?, LENGTH_PREFIX + size)))
}

fn body_length(prefix: &[u8]) -> usize {
    let mut bytes = [0u8; LENGTH_PREFIX];
    bytes.copy_from_slice(&prefix[..LENGTH_PREFIX]);
    u32::from_be_bytes(bytes) as usize
}

fn decode_body(body: &[u8]) -> TransportResult<Message> {
    let frames: Vec<Frame> = bincode::deserialize(body)?;
    Ok(Message::from_frames(frames))
}

// ----------------------------------------------------------------------------
// Async Stream Helpers
// ----------------------------------------------------------------------------

pub async fn write_message<W>(writer: &mut W, message: &Message, max_size: usize) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = encode(message, max_size)?;
    writer.write_all(&wire).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message; `None` on a clean end of stream between frames
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> TransportResult<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = body_length(&prefix);
    check_size(size, max_size)?;

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}
