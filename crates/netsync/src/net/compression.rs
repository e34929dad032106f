use std::fmt::Debug;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(io::Error),
    #[error("decompression failed: {0}")]
    Decompress(io::Error),
    #[error("decompressed payload exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

/// Swappable payload codec. Output is appended to `out`; the compressed
/// form must carry whatever it needs to restore the exact original bytes.
pub trait Compressor: Send + Sync + Debug {
    fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError>;

    /// Fails with [`CompressionError::TooLarge`] as soon as the restored
    /// bytes would pass `limit`, without inflating the rest.
    fn decompress(&self, input: &[u8], limit: usize, out: &mut Vec<u8>) -> Result<(), CompressionError>;
}

#[cfg(feature = "zstd")]
pub use self::zstd_codec::ZstdCompressor;

#[cfg(feature = "zstd")]
mod zstd_codec {
    use std::io::Read;

    use super::{CompressionError, Compressor};

    #[derive(Debug, Clone, Copy)]
    pub struct ZstdCompressor {
        level: i32,
    }

    impl Default for ZstdCompressor {
        fn default() -> Self {
            Self { level: 3 }
        }
    }

    impl ZstdCompressor {
        pub fn with_level(level: i32) -> Self {
            Self { level }
        }
    }

    impl Compressor for ZstdCompressor {
        fn compress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
            zstd::stream::copy_encode(input, &mut *out, self.level).map_err(CompressionError::Compress)
        }

        fn decompress(&self, input: &[u8], limit: usize, out: &mut Vec<u8>) -> Result<(), CompressionError> {
            let start = out.len();
            let decoder = zstd::stream::read::Decoder::with_buffer(input).map_err(CompressionError::Decompress)?;
            decoder
                .take(limit as u64 + 1)
                .read_to_end(out)
                .map_err(CompressionError::Decompress)?;

            if out.len() - start > limit {
                out.truncate(start);
                return Err(CompressionError::TooLarge { limit });
            }
            Ok(())
        }
    }
}

#[cfg(all(test, feature = "zstd"))]
mod tests {
    use super::*;

    #[test]
    fn zstd_restores_exact_bytes() {
        let codec = ZstdCompressor::default();
        let input: Vec<u8> = (0..4096u32).map(|i| (i % 17) as u8).collect();

        let mut packed = Vec::new();
        codec.compress(&input, &mut packed).unwrap();
        assert!(packed.len() < input.len());

        let mut unpacked = Vec::new();
        codec.decompress(&packed, input.len(), &mut unpacked).unwrap();
        assert_eq!(unpacked, input);
    }

    #[test]
    fn zstd_stops_at_output_limit() {
        let codec = ZstdCompressor::default();
        let mut packed = Vec::new();
        codec.compress(&vec![0u8; 1 << 20], &mut packed).unwrap();
        assert!(packed.len() < 1024);

        let mut out = Vec::new();
        assert!(matches!(
            codec.decompress(&packed, 4096, &mut out),
            Err(CompressionError::TooLarge { limit: 4096 })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn zstd_rejects_garbage() {
        let codec = ZstdCompressor::default();
        let mut out = Vec::new();
        assert!(codec.decompress(b"not zstd at all", 1024, &mut out).is_err());
    }
}
