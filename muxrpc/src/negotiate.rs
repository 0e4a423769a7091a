use std::net::SocketAddr;

use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, ErrorKind, Result},
    frame::{ReadChunk, read_exactly},
};

pub(crate) const MAGIC: [u8; 8] = *b"MUXRPC01";

pub(crate) const FEATURE_COMPRESS: u32 = 0;
pub(crate) const FEATURE_TIMEOUT: u32 = 1;

/// Features active on a connection after negotiation.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Features(u8);

bitflags! {
    impl Features: u8 {
        const COMPRESS = 1;
        const TIMEOUT = 2;
    }
}

/// Feature records exchanged in the negotiation frame.
///
/// Keys are unique; wire order is insertion order but carries no meaning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FeatureMap {
    entries: Vec<(u32, Vec<u8>)>,
}

impl FeatureMap {
    pub fn insert(&mut self, feature: u32, value: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|(f, _)| *f == feature) {
            entry.1 = value;
        } else {
            self.entries.push((feature, value));
        }
    }

    pub fn get(&self, feature: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(f, _)| *f == feature)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.entries.iter().map(|(f, v)| (*f, v.as_slice()))
    }
}

pub(crate) async fn send_negotiation_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    features: &FeatureMap,
) -> Result<()> {
    let extra_len: usize = features.iter().map(|(_, v)| 8 + v.len()).sum();
    let mut buf = Vec::with_capacity(12 + extra_len);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&(extra_len as u32).to_le_bytes());
    for (feature, value) in features.iter() {
        buf.extend_from_slice(&feature.to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    stream
        .write_all(&buf)
        .await
        .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
}

pub(crate) async fn recv_negotiation_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    peer: SocketAddr,
) -> Result<FeatureMap> {
    let header = match read_exactly(stream, 12).await? {
        ReadChunk::Full(buf) => buf,
        ReadChunk::Eof(got) => {
            if got != 0 {
                tracing::warn!(%peer, "unexpected eof during negotiation frame");
            }
            return Err(Error::kind(ErrorKind::Closed));
        }
    };
    if header[0..8] != MAGIC {
        tracing::warn!(%peer, "wrong protocol magic");
        return Err(Error::kind(ErrorKind::Closed));
    }
    let extra_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

    let extra = match read_exactly(stream, extra_len).await? {
        ReadChunk::Full(buf) => buf,
        ReadChunk::Eof(_) => {
            tracing::warn!(%peer, "unexpected eof during negotiation frame");
            return Err(Error::kind(ErrorKind::Closed));
        }
    };

    let mut map = FeatureMap::default();
    let mut rest = &extra[..];
    while !rest.is_empty() {
        if rest.len() < 8 {
            tracing::warn!(%peer, "bad feature data format in negotiation frame");
            return Err(Error::kind(ErrorKind::Closed));
        }
        let feature = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let value_len = u32::from_le_bytes(rest[4..8].try_into().unwrap()) as usize;
        rest = &rest[8..];
        if value_len > rest.len() {
            tracing::warn!(%peer, "buffer underflow in feature data in negotiation frame");
            return Err(Error::kind(ErrorKind::Closed));
        }
        map.insert(feature, rest[..value_len].to_vec());
        rest = &rest[value_len..];
    }
    Ok(map)
}
