//! The multi-frame message codec shared by every stream-based endpoint.
//!
//! A message is a u32 frame count followed by each frame as a u32 length and
//! its bytes, all big-endian. Both counts and lengths carry sanity caps so a
//! confused peer cannot make a reader allocate without bound.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAMES: u32 = 16;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Writes one complete message. The frames are gathered into a single buffer
/// first so the write is one syscall in the common case.
pub(crate) async fn write_message<W>(writer: &mut W, frames: &[Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(frames.len() as u32 <= MAX_FRAMES);
    let total: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Reads one complete message, or an error when the peer hangs up or the
/// framing is malformed.
pub(crate) async fn read_message<R>(reader: &mut R) -> io::Result<Vec<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u32().await?;
    if count == 0 || count > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("implausible frame count {count}"),
        ));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible frame length {len}"),
            ));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }
    Ok(frames)
}

/// Convenience for the common text frame.
pub(crate) fn text_frame(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Decodes a frame that must be UTF-8 text.
pub(crate) fn frame_text(frame: &Bytes) -> Result<&str, crate::error::Error> {
    std::str::from_utf8(frame)
        .map_err(|_| crate::error::Error::Protocol("frame is not UTF-8 text".into()))
}
