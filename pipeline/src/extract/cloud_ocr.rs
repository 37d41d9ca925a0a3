use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::{PipelineError, PipelineResult},
    rate_limiters::RateLimiters,
    HttpClient,
};

use super::{render::PageRenderer, CloudOcr};

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    markdown: String,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    pages: Vec<OcrPage>,
}

/// Mistral OCR on an image of the first page.
pub struct MistralOcr {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    renderer: PageRenderer,
    endpoint: String,
    api_key: String,
    model: String,
}

impl MistralOcr {
    pub fn new(
        http_client: HttpClient,
        rate_limiters: RateLimiters,
        renderer: PageRenderer,
        base_url: &str,
        api_key: &str,
        model: &str,
    ) -> Self {
        Self {
            http_client,
            rate_limiters,
            renderer,
            endpoint: format!("{}/v1/ocr", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl CloudOcr for MistralOcr {
    /// Page 1 as PNG.
    async fn prepare(&self, pdf: &[u8]) -> PipelineResult<Vec<u8>> {
        let page = self.renderer.render_first_page(pdf).await?;
        page.png_bytes().await
    }

    async fn ocr_prepared(&self, png: &[u8]) -> PipelineResult<String> {
        let image_url = format!("data:image/png;base64,{}", lib_utils::b64::encode(png));

        self.rate_limiters.acquire_ocr_page().await;

        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": &self.model,
                "document": {
                    "type": "image_url",
                    "image_url": image_url,
                },
            }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            if body.contains("rate limit exceeded") {
                self.rate_limiters.trigger_backoff();
            }
            return Err(PipelineError::from_status(status, &body));
        }

        let parsed: OcrResponse = serde_json::from_str(&body)?;
        let text = parsed
            .pages
            .into_iter()
            .next()
            .map(|p| p.markdown.trim().to_string())
            .ok_or_else(|| PipelineError::InvalidResponse("OCR returned no pages".to_string()))?;
        Ok(text)
    }
}
