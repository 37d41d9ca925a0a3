use std::path::PathBuf;

use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{PipelineError, PipelineResult};

/// First page rasterized to PNG. Files live until this is dropped.
pub struct RenderedPage {
    _dir: TempDir,
    pub path: PathBuf,
}

impl RenderedPage {
    pub async fn png_bytes(&self) -> PipelineResult<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| PipelineError::Ocr(format!("rendered page unreadable: {}", e)))
    }
}

/// Renders pages with poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PageRenderer {
    binary: String,
    dpi: u32,
}

impl PageRenderer {
    pub fn new(dpi: u32) -> Self {
        Self {
            binary: "pdftoppm".to_string(),
            dpi,
        }
    }

    pub async fn render_first_page(&self, pdf: &[u8]) -> PipelineResult<RenderedPage> {
        let dir = tempfile::tempdir()
            .map_err(|e| PipelineError::Ocr(format!("could not create temp dir: {}", e)))?;
        let input = dir.path().join("input.pdf");
        let output_stem = dir.path().join("page");

        tokio::fs::write(&input, pdf)
            .await
            .map_err(|e| PipelineError::Ocr(format!("could not write pdf: {}", e)))?;

        let output = Command::new(&self.binary)
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .args(["-f", "1", "-l", "1", "-singlefile"])
            .arg(&input)
            .arg(&output_stem)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Ocr(format!("{} unavailable: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Ocr(format!(
                "{} failed ({}): {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        let path = output_stem.with_extension("png");
        if !path.exists() {
            return Err(PipelineError::Ocr("renderer produced no page".to_string()));
        }
        Ok(RenderedPage { _dir: dir, path })
    }
}
