use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    compress::Compressor,
    error::{Error, ErrorKind, Result},
};

/// Head space reserved in request buffers: expire_ms + verb + msg_id + len.
pub(crate) const REQUEST_HEAD_SPACE: usize = 28;
/// Head space reserved in response buffers: msg_id + len.
pub(crate) const RESPONSE_HEAD_SPACE: usize = 12;

/// Wire frame descriptor: header length, decoding and the payload length it
/// announces. All integers on the wire are little-endian.
pub(crate) trait FrameKind {
    const HEADER_LEN: usize;
    /// Which side reads this frame, for log messages.
    const ROLE: &'static str;
    type Header: Send + 'static;

    fn decode_header(buf: &[u8]) -> Self::Header;
    fn body_len(header: &Self::Header) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequestHeader {
    pub expire_ms: Option<u64>,
    pub verb: u64,
    pub msg_id: i64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponseHeader {
    pub msg_id: i64,
    pub len: u32,
}

/// Request frame when the timeout feature was not negotiated.
pub(crate) struct RequestFrame;

impl FrameKind for RequestFrame {
    const HEADER_LEN: usize = 20;
    const ROLE: &'static str = "server";
    type Header = RequestHeader;

    fn decode_header(buf: &[u8]) -> RequestHeader {
        RequestHeader {
            expire_ms: None,
            verb: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            msg_id: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    fn body_len(header: &RequestHeader) -> usize {
        header.len as usize
    }
}

/// Request frame with the 8-byte expiration prefix.
pub(crate) struct RequestFrameWithTimeout;

impl FrameKind for RequestFrameWithTimeout {
    const HEADER_LEN: usize = 28;
    const ROLE: &'static str = "server";
    type Header = RequestHeader;

    fn decode_header(buf: &[u8]) -> RequestHeader {
        let mut header = RequestFrame::decode_header(&buf[8..]);
        header.expire_ms = Some(u64::from_le_bytes(buf[0..8].try_into().unwrap()));
        header
    }

    fn body_len(header: &RequestHeader) -> usize {
        header.len as usize
    }
}

pub(crate) struct ResponseFrame;

impl FrameKind for ResponseFrame {
    const HEADER_LEN: usize = 12;
    const ROLE: &'static str = "client";
    type Header = ResponseHeader;

    fn decode_header(buf: &[u8]) -> ResponseHeader {
        ResponseHeader {
            msg_id: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    fn body_len(header: &ResponseHeader) -> usize {
        header.len as usize
    }
}

/// Fills the 28-byte request header in place. The buffer must have been
/// marshalled with [`REQUEST_HEAD_SPACE`] head space.
pub(crate) fn write_request_header(buf: &mut [u8], expire_ms: u64, verb: u64, msg_id: i64) {
    let payload_len = (buf.len() - REQUEST_HEAD_SPACE) as u32;
    buf[0..8].copy_from_slice(&expire_ms.to_le_bytes());
    buf[8..16].copy_from_slice(&verb.to_le_bytes());
    buf[16..24].copy_from_slice(&msg_id.to_le_bytes());
    buf[24..28].copy_from_slice(&payload_len.to_le_bytes());
}

/// Fills the 12-byte response header in place. The buffer must have been
/// marshalled with [`RESPONSE_HEAD_SPACE`] head space.
pub(crate) fn write_response_header(buf: &mut [u8], msg_id: i64) {
    let payload_len = (buf.len() - RESPONSE_HEAD_SPACE) as u32;
    buf[0..8].copy_from_slice(&msg_id.to_le_bytes());
    buf[8..12].copy_from_slice(&payload_len.to_le_bytes());
}

pub(crate) enum ReadChunk {
    Full(BytesMut),
    /// End of stream after this many bytes (possibly zero).
    Eof(usize),
}

/// Reads exactly `n` bytes, or reports how far the stream got before EOF.
pub(crate) async fn read_exactly<R: AsyncRead + Unpin>(
    stream: &mut R,
    n: usize,
) -> Result<ReadChunk> {
    let mut buf = BytesMut::with_capacity(n);
    while buf.len() < n {
        let read = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
        if read == 0 {
            return Ok(ReadChunk::Eof(buf.len()));
        }
    }
    Ok(ReadChunk::Full(buf))
}

/// Reads one plaintext frame. `Ok(None)` means the connection is done:
/// either a clean close on a frame boundary (no log) or a truncated frame
/// (logged).
pub(crate) async fn read_frame<F: FrameKind, R: AsyncRead + Unpin>(
    stream: &mut R,
    peer: SocketAddr,
) -> Result<Option<(F::Header, Bytes)>> {
    let header = match read_exactly(stream, F::HEADER_LEN).await? {
        ReadChunk::Full(buf) => F::decode_header(&buf),
        ReadChunk::Eof(0) => return Ok(None),
        ReadChunk::Eof(got) => {
            tracing::warn!(
                %peer,
                "unexpected eof on a {} while reading header: expected {} got {got}",
                F::ROLE,
                F::HEADER_LEN,
            );
            return Ok(None);
        }
    };

    let body_len = F::body_len(&header);
    match read_exactly(stream, body_len).await? {
        ReadChunk::Full(buf) => Ok(Some((header, buf.freeze()))),
        ReadChunk::Eof(0) => Ok(None),
        ReadChunk::Eof(got) => {
            tracing::warn!(
                %peer,
                "unexpected eof on a {} while reading data: expected {body_len} got {got}",
                F::ROLE,
            );
            Ok(None)
        }
    }
}

/// Reads one frame through the compressed envelope when a compressor is
/// active, or a plaintext frame otherwise.
pub(crate) async fn read_frame_compressed<F: FrameKind, R: AsyncRead + Unpin>(
    stream: &mut R,
    compressor: Option<&dyn Compressor>,
    peer: SocketAddr,
) -> Result<Option<(F::Header, Bytes)>> {
    let Some(compressor) = compressor else {
        return read_frame::<F, R>(stream, peer).await;
    };

    let envelope_len = match read_exactly(stream, 4).await? {
        ReadChunk::Full(buf) => u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize,
        ReadChunk::Eof(0) => return Ok(None),
        ReadChunk::Eof(got) => {
            tracing::warn!(
                %peer,
                "unexpected eof on a {} while reading compression header: expected 4 got {got}",
                F::ROLE,
            );
            return Ok(None);
        }
    };
    let compressed = match read_exactly(stream, envelope_len).await? {
        ReadChunk::Full(buf) => buf,
        ReadChunk::Eof(0) => return Ok(None),
        ReadChunk::Eof(got) => {
            tracing::warn!(
                %peer,
                "unexpected eof on a {} while reading compressed data: expected {envelope_len} got {got}",
                F::ROLE,
            );
            return Ok(None);
        }
    };

    let plain = compressor.decompress(&compressed)?;
    Ok(parse_frame::<F>(&plain, peer))
}

/// Parses one frame out of a decompressed buffer. Bytes past the announced
/// payload length are ignored, mirroring the plaintext reader's framing.
fn parse_frame<F: FrameKind>(buf: &[u8], peer: SocketAddr) -> Option<(F::Header, Bytes)> {
    if buf.len() < F::HEADER_LEN {
        if !buf.is_empty() {
            tracing::warn!(
                %peer,
                "unexpected eof on a {} while reading header: expected {} got {}",
                F::ROLE,
                F::HEADER_LEN,
                buf.len(),
            );
        }
        return None;
    }
    let header = F::decode_header(buf);
    let body_len = F::body_len(&header);
    let avail = buf.len() - F::HEADER_LEN;
    if avail < body_len {
        tracing::warn!(
            %peer,
            "unexpected eof on a {} while reading data: expected {body_len} got {avail}",
            F::ROLE,
        );
        return None;
    }
    let body = Bytes::copy_from_slice(&buf[F::HEADER_LEN..F::HEADER_LEN + body_len]);
    Some((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_request_header_layout() {
        // verb 1, payload of 4 bytes, little-endian throughout.
        let mut buf = vec![0u8; REQUEST_HEAD_SPACE];
        buf.extend_from_slice(&[0x04, 0x03, 0x02, 0x01]);
        write_request_header(&mut buf, 0, 1, 7);
        assert_eq!(&buf[0..8], &[0; 8]);
        assert_eq!(&buf[8..16], &[0x01, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[16..24], &[0x07, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[24..28], &[0x04, 0, 0, 0]);

        let header = RequestFrameWithTimeout::decode_header(&buf[..28]);
        assert_eq!(header.expire_ms, Some(0));
        assert_eq!(header.verb, 1);
        assert_eq!(header.msg_id, 7);
        assert_eq!(header.len, 4);

        // Without the timeout feature the expire prefix is trimmed away.
        let header = RequestFrame::decode_header(&buf[8..28]);
        assert_eq!(header.expire_ms, None);
        assert_eq!(header.verb, 1);
        assert_eq!(header.msg_id, 7);
        assert_eq!(header.len, 4);
    }

    #[test]
    fn test_response_header_layout() {
        let mut buf = vec![0u8; RESPONSE_HEAD_SPACE + 2];
        write_response_header(&mut buf, -9);
        let header = ResponseFrame::decode_header(&buf);
        assert_eq!(header.msg_id, -9);
        assert_eq!(header.len, 2);
    }

    #[tokio::test]
    async fn test_read_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let mut buf = vec![0u8; REQUEST_HEAD_SPACE];
        buf.extend_from_slice(b"ab");
        write_request_header(&mut buf, 5, 2, 3);
        tx.write_all(&buf).await.unwrap();
        drop(tx);

        let (header, body) = read_frame::<RequestFrameWithTimeout, _>(&mut rx, peer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header.expire_ms, Some(5));
        assert_eq!(header.verb, 2);
        assert_eq!(header.msg_id, 3);
        assert_eq!(&body[..], b"ab");

        // Clean close on the frame boundary.
        let next = read_frame::<RequestFrameWithTimeout, _>(&mut rx, peer())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tx.write_all(&[1, 2, 3]).await.unwrap();
        drop(tx);

        let frame = read_frame::<ResponseFrame, _>(&mut rx, peer()).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_compressed_roundtrip() {
        use crate::compress::{CompressorFactory, ZstdFactory};

        let factory = ZstdFactory::default();
        let compressor = factory.negotiate(&factory.supported(), true).unwrap();

        let mut plain = vec![0u8; RESPONSE_HEAD_SPACE];
        plain.extend_from_slice(b"payload");
        write_response_header(&mut plain, 11);

        let compressed = compressor.compress(&plain).unwrap();
        let mut wire = (u32::try_from(compressed.len()).unwrap())
            .to_le_bytes()
            .to_vec();
        wire.extend_from_slice(&compressed);

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&wire).await.unwrap();
        drop(tx);

        let (header, body) =
            read_frame_compressed::<ResponseFrame, _>(&mut rx, Some(compressor.as_ref()), peer())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(header.msg_id, 11);
        assert_eq!(&body[..], b"payload");
    }
}
