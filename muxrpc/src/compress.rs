use crate::error::{Error, ErrorKind, Result};

/// Per-direction frame compressor chosen during negotiation.
pub trait Compressor: Send + Sync {
    /// # Errors
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// # Errors
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Picks a concrete [`Compressor`] from the peer's advertised blob.
pub trait CompressorFactory: Send + Sync {
    /// Opaque blob advertised in the negotiation frame.
    fn supported(&self) -> Vec<u8>;

    /// Returns `None` when the peer's blob has no overlap with this factory.
    fn negotiate(&self, peer_blob: &[u8], is_server: bool) -> Option<Box<dyn Compressor>>;
}

/// Stock zstd factory. The advertised blob is the algorithm name.
#[derive(Debug, Clone)]
pub struct ZstdFactory {
    pub level: i32,
}

impl Default for ZstdFactory {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl CompressorFactory for ZstdFactory {
    fn supported(&self) -> Vec<u8> {
        b"zstd".to_vec()
    }

    fn negotiate(&self, peer_blob: &[u8], _is_server: bool) -> Option<Box<dyn Compressor>> {
        if peer_blob == b"zstd" {
            Some(Box::new(ZstdCompressor { level: self.level }))
        } else {
            None
        }
    }
}

struct ZstdCompressor {
    level: i32,
}

impl Compressor for ZstdCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(input, self.level)
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(input)
            .map_err(|e| Error::new(ErrorKind::Protocol, format!("decompression failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let factory = ZstdFactory::default();
        let c = factory.negotiate(&factory.supported(), false).unwrap();
        let data = vec![7u8; 4096];
        let compressed = c.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(c.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_no_overlap_declines() {
        let factory = ZstdFactory::default();
        assert!(factory.negotiate(b"lz4", true).is_none());
    }

    #[test]
    fn test_corrupt_input_is_a_protocol_error() {
        let factory = ZstdFactory::default();
        let c = factory.negotiate(b"zstd", true).unwrap();
        let err = c.decompress(b"not zstd").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }
}
