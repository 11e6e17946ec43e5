//! Length-prefixed frame codec for byte-stream transports.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`. Channels
//! preserve message boundaries on their own; frames restore them when a
//! message has to cross a Unix socket or TCP stream.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Serializes `msg` and checks it against the frame limit.
fn to_frame(msg: &impl Serialize) -> io::Result<(u32, Vec<u8>)> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    Ok((len, payload))
}

/// Validates a length prefix read off the wire.
fn check_len(len: u32) -> io::Result<usize> {
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    Ok(len as usize)
}

/// Encodes `msg` as a length-prefixed postcard frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let (len, payload) = to_frame(msg)?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads a length-prefixed postcard frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = check_len(u32::from_be_bytes(buf))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Async counterpart of [`encode`]. Does not flush; callers batch frames.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let (len, payload) = to_frame(msg)?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&payload).await
}

/// Async counterpart of [`decode`].
///
/// A clean EOF before the length prefix surfaces as
/// [`io::ErrorKind::UnexpectedEof`].
pub async fn recv<T: for<'de> Deserialize<'de>>(
    r: &mut (impl AsyncRead + Unpin),
) -> io::Result<T> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await?;
    let len = check_len(u32::from_be_bytes(buf))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageHeader, decode_message, encode_message};

    #[test]
    fn frame_carries_raw_message() {
        let msg = encode_message(7, 0x10, &"hello".to_owned()).unwrap();

        let mut buf = Vec::new();
        encode(&mut buf, &msg).unwrap();
        assert_eq!(&buf[..4], &((buf.len() - 4) as u32).to_be_bytes());

        let mut cursor = io::Cursor::new(&buf);
        let bytes: Vec<u8> = decode(&mut cursor).unwrap();
        let (header, body): (MessageHeader, String) = decode_message(&bytes).unwrap();
        assert_eq!(header.txid, 7);
        assert_eq!(header.ordinal, 0x10);
        assert_eq!(body, "hello");
    }

    #[test]
    fn consecutive_frames_keep_boundaries() {
        let mut buf = Vec::new();
        encode(&mut buf, &vec![1u8, 2, 3]).unwrap();
        encode(&mut buf, &Vec::<u8>::new()).unwrap();
        encode(&mut buf, &vec![9u8]).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        assert_eq!(decode::<Vec<u8>>(&mut cursor).unwrap(), vec![1, 2, 3]);
        assert!(decode::<Vec<u8>>(&mut cursor).unwrap().is_empty());
        assert_eq!(decode::<Vec<u8>>(&mut cursor).unwrap(), vec![9]);
        let eof = decode::<Vec<u8>>(&mut cursor).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_oversized_frame() {
        // Craft a frame header claiming 32 MiB
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        let mut cursor = io::Cursor::new(&header[..]);
        let result: io::Result<Vec<u8>> = decode(&mut cursor);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_frames_match_blocking_frames() {
        let mut blocking = Vec::new();
        encode(&mut blocking, &vec![4u8, 5, 6]).unwrap();

        let mut streamed = Vec::new();
        send(&mut streamed, &vec![4u8, 5, 6]).await.unwrap();
        assert_eq!(blocking, streamed);

        let mut reader = &streamed[..];
        let back: Vec<u8> = recv(&mut reader).await.unwrap();
        assert_eq!(back, vec![4, 5, 6]);

        let eof = recv::<Vec<u8>>(&mut reader).await.unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }
}
