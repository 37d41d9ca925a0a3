use std::sync::OnceLock;

pub use tokenizers::Tokenizer;

/// Approximate characters per token when no tokenizer file is available.
pub const CHARS_PER_TOKEN: usize = 4;

static TOKENIZER: OnceLock<Option<Tokenizer>> = OnceLock::new();

fn get_tokenizer() -> Option<&'static Tokenizer> {
    TOKENIZER
        .get_or_init(|| {
            let tokenizer_path = std::env::var("TOKENIZER_PATH").unwrap_or_else(|_| {
                concat!(env!("CARGO_MANIFEST_DIR"), "/tokenizer.json").to_string()
            });
            match Tokenizer::from_file(&tokenizer_path) {
                Ok(tokenizer) => Some(tokenizer),
                Err(e) => {
                    tracing::warn!(
                        "Tokenizer unavailable at {}, falling back to estimates: {}",
                        tokenizer_path,
                        e
                    );
                    None
                }
            }
        })
        .as_ref()
}

/// Character based estimate, rounded up so that non-empty text never costs zero.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Count tokens with the loaded tokenizer, or estimate when it can't be used.
pub fn token_count(text: &str) -> usize {
    let Some(tokenizer) = get_tokenizer() else {
        return estimate_tokens(text);
    };
    match tokenizer.encode(text, false) {
        Ok(encoding) => encoding.len(),
        Err(e) => {
            tracing::debug!("Tokenizer encode failed, estimating: {}", e);
            estimate_tokens(text)
        }
    }
}

/// Whether counts come from a real tokenizer rather than the estimate.
pub fn is_exact() -> bool {
    get_tokenizer().is_some()
}
