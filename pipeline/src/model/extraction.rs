use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const TRUNCATION_MARKER: &str = "\n[TRUNCATED]";

/// Which tier produced an attachment's text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provenance {
    Native,
    CloudOcr,
    LocalOcr,
    Error(String),
}

impl Provenance {
    pub fn is_error(&self) -> bool {
        matches!(self, Provenance::Error(_))
    }

    /// Tag without the error reason, for counters.
    pub fn tier(&self) -> &'static str {
        match self {
            Provenance::Native => "native",
            Provenance::CloudOcr => "cloud_ocr",
            Provenance::LocalOcr => "local_ocr",
            Provenance::Error(_) => "error",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Error(reason) => write!(f, "error:{}", reason),
            other => f.write_str(other.tier()),
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Provenance::Native),
            "cloud_ocr" => Ok(Provenance::CloudOcr),
            "local_ocr" => Ok(Provenance::LocalOcr),
            _ => match s.strip_prefix("error:") {
                Some(reason) => Ok(Provenance::Error(reason.to_string())),
                None => Err(format!("unknown provenance '{}'", s)),
            },
        }
    }
}

impl Serialize for Provenance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Provenance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Text of one attachment, addressed by (email_index, attachment_index)
/// within its thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub email_index: usize,
    pub attachment_index: usize,
    pub attachment_name: String,
    pub text: String,
    pub provenance: Provenance,
    #[serde(default)]
    pub truncated: bool,
}

impl ExtractionResult {
    pub fn error(
        email_index: usize,
        attachment_index: usize,
        attachment_name: &str,
        reason: &str,
    ) -> Self {
        Self {
            email_index,
            attachment_index,
            attachment_name: attachment_name.to_string(),
            text: format!("[Error: {}]", reason),
            provenance: Provenance::Error(reason.to_string()),
            truncated: false,
        }
    }
}

/// Cut `text` to at most `cap` characters, appending the truncation marker
/// when anything was removed.
pub fn truncate_chars(text: &str, cap: usize) -> (String, bool) {
    match text.char_indices().nth(cap) {
        None => (text.to_string(), false),
        Some((byte_idx, _)) => {
            let mut out = text[..byte_idx].to_string();
            out.push_str(TRUNCATION_MARKER);
            (out, true)
        }
    }
}

/// Extraction output for one thread, ready to be packed for classification.
#[derive(Debug, Clone)]
pub struct ThreadDocument {
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub date: String,
    pub text: String,
    pub extractions: Vec<ExtractionResult>,
}

impl ThreadDocument {
    pub fn new(
        thread_id: String,
        emails: &[super::EmailRecord],
        extractions: Vec<ExtractionResult>,
        max_chars: usize,
    ) -> Self {
        let first = emails.first();
        let sections = extractions
            .iter()
            .map(|e| format!("--- {} ---\n{}", e.attachment_name, e.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let (text, _) = truncate_chars(&sections, max_chars);

        Self {
            thread_id,
            sender: first.map(|e| e.from.clone()).unwrap_or_default(),
            subject: first.map(|e| e.subject.clone()).unwrap_or_default(),
            date: first.map(|e| e.date.clone()).unwrap_or_default(),
            text,
            extractions,
        }
    }

    pub fn attachment_names(&self) -> Vec<String> {
        self.extractions
            .iter()
            .map(|e| e.attachment_name.clone())
            .collect()
    }

    pub fn provenances(&self) -> Vec<Provenance> {
        self.extractions.iter().map(|e| e.provenance.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_tags() {
        for (tag, value) in [
            ("native", Provenance::Native),
            ("cloud_ocr", Provenance::CloudOcr),
            ("local_ocr", Provenance::LocalOcr),
            ("error:not_pdf", Provenance::Error("not_pdf".to_string())),
        ] {
            assert_eq!(value.to_string(), tag);
            assert_eq!(tag.parse::<Provenance>().unwrap(), value);
        }
        assert!("scanner".parse::<Provenance>().is_err());
    }

    #[test]
    fn test_provenance_serializes_as_string() {
        let json = serde_json::to_string(&Provenance::Error("timeout".to_string())).unwrap();
        assert_eq!(json, "\"error:timeout\"");
    }

    #[test]
    fn test_truncate_appends_marker() {
        let (text, truncated) = truncate_chars("abcdef", 4);
        assert_eq!(text, "abcd\n[TRUNCATED]");
        assert!(truncated);

        let (text, truncated) = truncate_chars("abcd", 4);
        assert_eq!(text, "abcd");
        assert!(!truncated);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let (text, truncated) = truncate_chars("żółw", 2);
        assert_eq!(text, "żó\n[TRUNCATED]");
        assert!(truncated);
    }
}
