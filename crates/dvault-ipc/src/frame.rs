//! Async frame I/O over any tokio stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{encode_frame, FrameError};

/// Read one frame. `Ok(None)` means the peer closed the stream between
/// frames.
pub async fn read_frame<R, T>(reader: &mut R, max_frame: u32) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_frame as usize {
        return Err(FrameError::TooLarge {
            len,
            max: max_frame,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}

/// Write one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame: u32) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value, max_frame)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
