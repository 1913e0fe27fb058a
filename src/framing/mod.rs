//! Byte Framing
//!
//! Small helpers for gluing response buffers together and for pulling
//! fixed-length binary fields off a buffer or an async stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Concatenate two buffers into a fresh one
pub fn concat(head: &[u8], tail: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(head.len() + tail.len());
    out.put_slice(head);
    out.put_slice(tail);
    out.freeze()
}

/// Read a big-endian `u32` at `offset`
pub fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let field = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([field[0], field[1], field[2], field[3]]))
}

/// Read exactly `N` bytes from a stream into a fixed array
pub async fn read_array<R, const N: usize>(reader: &mut R) -> std::io::Result<[u8; N]>
where
    R: AsyncRead + Unpin,
{
    let mut field = [0u8; N];
    reader.read_exact(&mut field).await?;
    Ok(field)
}

/// Read exactly `len` bytes from a stream
///
/// A stream that ends early yields `UnexpectedEof`.
pub async fn read_field<R>(reader: &mut R, len: usize) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut field = vec![0u8; len];
    reader.read_exact(&mut field).await?;
    Ok(Bytes::from(field))
}
