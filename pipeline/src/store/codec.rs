use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, String> {
    let json = serde_json::to_vec(value).map_err(|e| e.to_string())?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(|e| e.to_string())?;
    encoder.finish().map_err(|e| e.to_string())
}

/// Producers have written both gzip and plain JSON for the same objects.
/// Decompress when the gzip magic is present, otherwise parse as is.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    if is_gzip(bytes) {
        let mut json = Vec::new();
        match GzDecoder::new(bytes).read_to_end(&mut json) {
            Ok(_) => return serde_json::from_slice(&json).map_err(|e| e.to_string()),
            Err(e) => {
                tracing::debug!("gzip decode failed, trying raw json: {}", e);
            }
        }
    }
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}
