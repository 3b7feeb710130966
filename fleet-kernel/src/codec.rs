/**
 * CODEC - Compression des snapshots
 *
 * RÔLE : ensemble fermé d'algorithmes choisi une fois au démarrage.
 * `None` = identité ; `Gzip` et `Deflate` via flate2 ; `Zstd` niveau 3.
 */

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{codec} compression failed: {source}")]
    Compress {
        codec: Codec,
        #[source]
        source: std::io::Error,
    },
    #[error("{codec} decompression failed: {source}")]
    Decompress {
        codec: Codec,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    None,
    Gzip,
    Deflate,
    Zstd,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Codec::None => "none",
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
            Codec::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl Codec {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let codec = *self;
        let wrap = |source| CodecError::Compress { codec, source };
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).map_err(wrap)?;
                enc.finish().map_err(wrap)
            }
            Codec::Deflate => {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).map_err(wrap)?;
                enc.finish().map_err(wrap)
            }
            Codec::Zstd => zstd::encode_all(data, ZSTD_LEVEL).map_err(wrap),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let codec = *self;
        let wrap = |source| CodecError::Decompress { codec, source };
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data).read_to_end(&mut out).map_err(wrap)?;
                Ok(out)
            }
            Codec::Deflate => {
                let mut out = Vec::new();
                DeflateDecoder::new(data).read_to_end(&mut out).map_err(wrap)?;
                Ok(out)
            }
            Codec::Zstd => zstd::decode_all(data).map_err(wrap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Codec; 4] = [Codec::None, Codec::Gzip, Codec::Deflate, Codec::Zstd];

    #[test]
    fn test_every_codec_restores_input() {
        let payload: Vec<u8> = br#"{"name":"edge-1","state":"Registered"}"#.repeat(200);
        for codec in ALL {
            let packed = codec.compress(&payload).unwrap();
            assert_eq!(codec.decompress(&packed).unwrap(), payload, "{codec}");
        }
    }

    #[test]
    fn test_empty_payload() {
        for codec in ALL {
            let packed = codec.compress(&[]).unwrap();
            assert!(codec.decompress(&packed).unwrap().is_empty(), "{codec}");
        }
    }

    #[test]
    fn test_identity_is_identity() {
        assert_eq!(Codec::None.compress(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_garbage_is_rejected() {
        let garbage = b"definitely not compressed";
        assert!(Codec::Gzip.decompress(garbage).is_err());
        assert!(Codec::Zstd.decompress(garbage).is_err());
    }
}
