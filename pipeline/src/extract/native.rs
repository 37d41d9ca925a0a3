use pdf_extract::{Document, PlainTextOutput};

use crate::error::{PipelineError, PipelineResult};

use super::NativeExtractor;

/// Embedded text layer via `pdf-extract`. Only page 1 is interpreted; the
/// rest of the document is parsed into objects but its content streams are
/// never run.
#[derive(Debug, Clone, Default)]
pub struct PdfTextLayer;

fn native_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Ocr(format!("native extraction failed: {}", e))
}

impl NativeExtractor for PdfTextLayer {
    fn first_page_text(&self, pdf: &[u8]) -> PipelineResult<String> {
        let mut doc = Document::load_mem(pdf).map_err(native_error)?;
        if doc.is_encrypted() {
            doc.decrypt("").map_err(native_error)?;
        }

        let mut text = String::new();
        {
            let mut output = PlainTextOutput::new(&mut text);
            pdf_extract::output_doc_page(&doc, &mut output, 1).map_err(native_error)?;
        }
        Ok(text)
    }
}
