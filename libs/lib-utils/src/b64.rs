use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty payload")]
    Empty,
    #[error("invalid base64: {0}")]
    Invalid(#[from] base64::DecodeError),
}

/// Decode a base64 payload written by any producer version.
///
/// Accepts standard and URL-safe alphabets, with or without padding,
/// embedded whitespace/newlines, and an optional `data:...;base64,` prefix.
pub fn decode_lenient(input: &str) -> Result<Vec<u8>, Error> {
    let input = match input.find(";base64,") {
        Some(idx) if input.starts_with("data:") => &input[idx + ";base64,".len()..],
        _ => input,
    };

    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(Error::Empty);
    }

    let url_safe = cleaned.contains('-') || cleaned.contains('_');
    let padded = cleaned.ends_with('=');

    let engine = match (url_safe, padded) {
        (false, true) => &STANDARD,
        (false, false) => &STANDARD_NO_PAD,
        (true, true) => &URL_SAFE,
        (true, false) => &URL_SAFE_NO_PAD,
    };

    match engine.decode(&cleaned) {
        Ok(bytes) => Ok(bytes),
        // Unpadded input whose length happens to be a multiple of 4
        Err(_) if !padded && !url_safe => STANDARD.decode(&cleaned).map_err(Error::from),
        Err(_) if !padded => URL_SAFE.decode(&cleaned).map_err(Error::from),
        Err(e) => Err(e.into()),
    }
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
