use async_trait::async_trait;
use tokio::{process::Command, sync::OnceCell};

use crate::error::{PipelineError, PipelineResult};

use super::{render::PageRenderer, LocalOcr};

/// Tesseract CLI on the first page rendered at 2x.
pub struct TesseractOcr {
    renderer: PageRenderer,
    lang: String,
    psm: u8,
    available: OnceCell<bool>,
}

impl TesseractOcr {
    pub fn new(renderer: PageRenderer, lang: &str, psm: u8) -> Self {
        Self {
            renderer,
            lang: lang.to_string(),
            psm,
            available: OnceCell::new(),
        }
    }

    async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                let version = Command::new("tesseract").arg("--version").output().await;
                let ok = version.as_ref().is_ok_and(|o| o.status.success());
                if !ok {
                    tracing::warn!("tesseract not available, local OCR disabled");
                }
                ok
            })
            .await
    }
}

#[async_trait]
impl LocalOcr for TesseractOcr {
    async fn ocr_first_page(&self, pdf: &[u8]) -> PipelineResult<String> {
        if !self.is_available().await {
            return Err(PipelineError::Ocr("tesseract unavailable".to_string()));
        }

        let page = self.renderer.render_first_page(pdf).await?;
        let output = Command::new("tesseract")
            .arg(&page.path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("--psm")
            .arg(self.psm.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Ocr(format!("tesseract failed to start: {}", e)))?;

        if !output.status.success() {
            return Err(PipelineError::Ocr(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
