//! Text Extraction Cascade
//!
//! Turns one base64 PDF attachment into bounded plain text using the cheapest
//! tier that is allowed to answer:
//! - native text layer of page 1 (accepted early only above a configured threshold)
//! - cloud OCR of page 1, the default final tier
//! - local OCR of page 1 at 2x, when selected by configuration
//!
//! Nothing here returns an error. Failures become `[Error: ...]` text with an
//! `error:<reason>` provenance so classification always has something to read.

mod cloud_ocr;
mod local_ocr;
mod native;
mod pools;
mod render;

pub use cloud_ocr::MistralOcr;
pub use local_ocr::TesseractOcr;
pub use native::PdfTextLayer;
pub use pools::ExtractionPools;
pub use render::PageRenderer;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use lib_utils::{retry, RetryPolicy};

use crate::{
    deadline::Deadline,
    error::{PipelineError, PipelineResult},
    model::{extraction::truncate_chars, Attachment, ExtractionResult, Provenance},
    pipeline_config::ExtractionConfig,
};

/// Embedded text of page 1. Runs on the blocking pool.
pub trait NativeExtractor: Send + Sync + 'static {
    fn first_page_text(&self, pdf: &[u8]) -> PipelineResult<String>;
}

/// Cloud OCR in two steps: local preparation of the upload (rasterizing
/// page 1) on the CPU pool, then the network call on the cloud pool.
#[async_trait]
pub trait CloudOcr: Send + Sync {
    async fn prepare(&self, pdf: &[u8]) -> PipelineResult<Vec<u8>>;

    async fn ocr_prepared(&self, upload: &[u8]) -> PipelineResult<String>;
}

#[async_trait]
pub trait LocalOcr: Send + Sync {
    async fn ocr_first_page(&self, pdf: &[u8]) -> PipelineResult<String>;
}

const PDF_MAGIC: &[u8] = b"%PDF";
/// Readers tolerate junk before the header within the first KiB.
const PDF_MAGIC_WINDOW: usize = 1024;

fn looks_like_pdf(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_MAGIC_WINDOW)];
    window.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC)
}

fn ocr_failure_reason(error: &PipelineError) -> String {
    match error {
        PipelineError::Ocr(_) => "ocr_failed".to_string(),
        other => format!("ocr_{}", other.reason()),
    }
}

pub struct ExtractionCascade {
    cfg: ExtractionConfig,
    native: Arc<dyn NativeExtractor>,
    cloud: Option<Arc<dyn CloudOcr>>,
    local: Option<Arc<dyn LocalOcr>>,
    pools: ExtractionPools,
    retry: RetryPolicy,
    ocr_timeout: Duration,
}

impl ExtractionCascade {
    pub fn new(
        cfg: ExtractionConfig,
        native: Arc<dyn NativeExtractor>,
        cloud: Option<Arc<dyn CloudOcr>>,
        local: Option<Arc<dyn LocalOcr>>,
        pools: ExtractionPools,
        retry: RetryPolicy,
        ocr_timeout: Duration,
    ) -> Self {
        if cloud.is_none() && local.is_none() {
            tracing::warn!("No OCR tier configured, scanned documents will yield error markers");
        }
        Self {
            cfg,
            native,
            cloud,
            local,
            pools,
            retry,
            ocr_timeout,
        }
    }

    pub async fn extract(
        &self,
        email_index: usize,
        attachment: Attachment<'_>,
        deadline: &Deadline,
    ) -> ExtractionResult {
        let (text, provenance) = match self.run(attachment.payload, deadline).await {
            Ok(found) => found,
            Err(reason) => {
                tracing::debug!("Extraction of '{}' failed: {}", attachment.name, reason);
                return ExtractionResult::error(
                    email_index,
                    attachment.index,
                    attachment.name,
                    &reason,
                );
            }
        };

        let (text, truncated) = truncate_chars(&text, self.cfg.char_cap);
        ExtractionResult {
            email_index,
            attachment_index: attachment.index,
            attachment_name: attachment.name.to_string(),
            text,
            provenance,
            truncated,
        }
    }

    /// Err carries the short reason used in the error marker.
    async fn run(&self, payload: &str, deadline: &Deadline) -> Result<(String, Provenance), String> {
        let bytes = lib_utils::b64::decode_lenient(payload).map_err(|e| match e {
            lib_utils::b64::Error::Empty => "empty_document".to_string(),
            lib_utils::b64::Error::Invalid(_) => "invalid_base64".to_string(),
        })?;
        if bytes.is_empty() {
            return Err("empty_document".to_string());
        }
        if bytes.len() > self.cfg.max_attachment_bytes {
            return Err("oversized".to_string());
        }
        if !looks_like_pdf(&bytes) {
            return Err("not_pdf".to_string());
        }
        let pdf = Arc::new(bytes);

        // 1. Native text layer
        let native = self.native.clone();
        let native_pdf = pdf.clone();
        let native_text = match self
            .pools
            .run_blocking(move || native.first_page_text(&native_pdf))
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::debug!("Native extraction failed, escalating: {}", e);
                String::new()
            }
        };
        let native_chars = native_text.chars().count();

        if let Some(threshold) = self.cfg.native_accept_threshold {
            if native_chars > 0 && native_chars >= threshold {
                return Ok((native_text, Provenance::Native));
            }
        }
        if self
            .cfg
            .smart_skip
            .should_skip_ocr(native_chars, self.cfg.smart_skip_min_chars)
        {
            return Ok((native_text, Provenance::Native));
        }

        // 2./3. OCR tiers
        match self.run_ocr(&pdf, deadline).await {
            Ok(found) => Ok(found),
            Err(e) if native_chars > 0 => {
                tracing::info!("OCR failed ({}), keeping native text", e);
                Ok((native_text, Provenance::Native))
            }
            Err(e) => Err(ocr_failure_reason(&e)),
        }
    }

    async fn run_ocr(
        &self,
        pdf: &[u8],
        deadline: &Deadline,
    ) -> PipelineResult<(String, Provenance)> {
        let cloud = self.cloud.as_ref().filter(|_| self.cfg.cloud_ocr_enabled);
        let local_first = self.cfg.prefer_local_ocr && self.local.is_some();

        if !local_first {
            if let Some(cloud) = cloud {
                match self.cloud_ocr(cloud.as_ref(), pdf, deadline).await {
                    Ok(text) => return Ok((text, Provenance::CloudOcr)),
                    Err(e) if self.cfg.local_fallback_on_cloud_error && self.local.is_some() => {
                        tracing::warn!("Cloud OCR failed, falling back to local OCR: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            } else if !self.cfg.local_fallback_on_cloud_error {
                return Err(PipelineError::Ocr("no OCR tier enabled".to_string()));
            }
        }

        match self.local.as_ref() {
            Some(local) => self
                .local_ocr(local.as_ref(), pdf)
                .await
                .map(|text| (text, Provenance::LocalOcr)),
            None => Err(PipelineError::Ocr("no OCR tier enabled".to_string())),
        }
    }

    async fn cloud_ocr(
        &self,
        cloud: &dyn CloudOcr,
        pdf: &[u8],
        deadline: &Deadline,
    ) -> PipelineResult<String> {
        let policy = self.retry.clone().with_deadline(deadline.instant());
        let timeout = self.ocr_timeout;
        let upload = self
            .pools
            .run_local(async move {
                tokio::time::timeout(timeout, cloud.prepare(pdf))
                    .await
                    .map_err(|_| PipelineError::Timeout(timeout))?
            })
            .await?;
        let upload = upload.as_slice();
        retry(
            &policy,
            "cloud_ocr",
            PipelineError::is_retryable,
            |_| {
                self.pools.run_cloud(async move {
                    tokio::time::timeout(timeout, cloud.ocr_prepared(upload))
                        .await
                        .map_err(|_| PipelineError::Timeout(timeout))?
                })
            },
        )
        .await
    }

    async fn local_ocr(&self, local: &dyn LocalOcr, pdf: &[u8]) -> PipelineResult<String> {
        let timeout = self.ocr_timeout;
        self.pools
            .run_local(async move {
                tokio::time::timeout(timeout, local.ocr_first_page(pdf))
                    .await
                    .map_err(|_| PipelineError::Timeout(timeout))?
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::EmailRecord,
        pipeline_config::SmartSkip,
        testing::{corrupt_payload, native_payload, scanned_payload, FakeNative, FakeOcr},
    };

    struct Setup {
        cfg: ExtractionConfig,
        cloud: Option<Arc<FakeOcr>>,
        local: Option<Arc<FakeOcr>>,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                cfg: ExtractionConfig::default(),
                cloud: Some(Arc::new(FakeOcr::returning("cloud text"))),
                local: Some(Arc::new(FakeOcr::returning("local text"))),
            }
        }

        fn build(&self) -> ExtractionCascade {
            ExtractionCascade::new(
                self.cfg.clone(),
                Arc::new(FakeNative),
                self.cloud.clone().map(|c| c as Arc<dyn CloudOcr>),
                self.local.clone().map(|l| l as Arc<dyn LocalOcr>),
                ExtractionPools::new(2, 2),
                RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
                Duration::from_millis(200),
            )
        }

        async fn run(&self, payload: &str) -> ExtractionResult {
            let email = EmailRecord {
                attachment_names: vec!["doc.pdf".to_string()],
                attachment_payloads: vec![payload.to_string()],
                ..Default::default()
            };
            let attachment = email.attachments()[0];
            self.build()
                .extract(0, attachment, &Deadline::new(Duration::from_secs(30)))
                .await
        }
    }

    #[tokio::test]
    async fn test_default_escalates_to_cloud_even_with_text() {
        let setup = Setup::new();
        let result = setup.run(&native_payload("Account statement for March")).await;
        assert_eq!(result.provenance, Provenance::CloudOcr);
        assert_eq!(result.text, "cloud text");
    }

    #[tokio::test]
    async fn test_accept_threshold_keeps_native() {
        let mut setup = Setup::new();
        setup.cfg.native_accept_threshold = Some(10);
        let result = setup.run(&native_payload("Account statement for March")).await;
        assert_eq!(result.provenance, Provenance::Native);
        assert_eq!(setup.cloud.as_ref().unwrap().calls(), 0);
    }

    #[tokio::test]
    async fn test_scanned_pdf_never_native_without_smart_skip() {
        let mut setup = Setup::new();
        setup.cfg.native_accept_threshold = Some(0);
        let result = setup.run(&scanned_payload()).await;
        assert_ne!(result.provenance, Provenance::Native);

        setup.cloud = Some(Arc::new(FakeOcr::failing()));
        let result = setup.run(&scanned_payload()).await;
        assert_ne!(result.provenance, Provenance::Native);
        assert!(result.provenance.is_error());
    }

    #[tokio::test]
    async fn test_smart_skip_modes() {
        let mut setup = Setup::new();
        setup.cfg.smart_skip = SmartSkip::SkipIfAnyText;
        setup.cfg.smart_skip_min_chars = 20;

        let short = setup.run(&native_payload("tiny")).await;
        assert_eq!(short.provenance, Provenance::CloudOcr);
        let long = setup.run(&native_payload("a long enough native text layer")).await;
        assert_eq!(long.provenance, Provenance::Native);

        setup.cfg.smart_skip = SmartSkip::SkipIfNonEmpty;
        let short = setup.run(&native_payload("tiny")).await;
        assert_eq!(short.provenance, Provenance::Native);
        let empty = setup.run(&scanned_payload()).await;
        assert_eq!(empty.provenance, Provenance::CloudOcr);
    }

    #[tokio::test]
    async fn test_prefer_local() {
        let mut setup = Setup::new();
        setup.cfg.prefer_local_ocr = true;
        let result = setup.run(&scanned_payload()).await;
        assert_eq!(result.provenance, Provenance::LocalOcr);
        assert_eq!(result.text, "local text");
        assert_eq!(setup.cloud.as_ref().unwrap().calls(), 0);
    }

    #[tokio::test]
    async fn test_local_fallback_only_when_enabled() {
        let mut setup = Setup::new();
        setup.cloud = Some(Arc::new(FakeOcr::failing()));

        let result = setup.run(&scanned_payload()).await;
        assert!(result.provenance.is_error());
        assert!(result.text.starts_with("[Error: "));
        assert_eq!(setup.local.as_ref().unwrap().calls(), 0);

        setup.cfg.local_fallback_on_cloud_error = true;
        let result = setup.run(&scanned_payload()).await;
        assert_eq!(result.provenance, Provenance::LocalOcr);
    }

    #[tokio::test]
    async fn test_ocr_failure_keeps_native_text() {
        let mut setup = Setup::new();
        setup.cloud = Some(Arc::new(FakeOcr::failing()));
        let result = setup.run(&native_payload("some native text")).await;
        assert_eq!(result.provenance, Provenance::Native);
        assert_eq!(result.text, "some native text");
    }

    #[tokio::test]
    async fn test_transient_cloud_errors_are_retried() {
        let mut setup = Setup::new();
        setup.cloud = Some(Arc::new(FakeOcr::flaky(1, "recovered")));
        let result = setup.run(&scanned_payload()).await;
        assert_eq!(result.provenance, Provenance::CloudOcr);
        assert_eq!(result.text, "recovered");
        assert_eq!(setup.cloud.as_ref().unwrap().calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_inputs_become_markers() {
        let setup = Setup::new();

        let result = setup.run("%%% not base64 %%%").await;
        assert_eq!(result.provenance, Provenance::Error("invalid_base64".to_string()));
        assert_eq!(result.text, "[Error: invalid_base64]");

        let result = setup.run(&corrupt_payload()).await;
        assert_eq!(result.provenance, Provenance::Error("not_pdf".to_string()));

        let result = setup.run("").await;
        assert_eq!(result.provenance, Provenance::Error("empty_document".to_string()));
    }

    #[tokio::test]
    async fn test_oversized_payload() {
        let mut setup = Setup::new();
        setup.cfg.max_attachment_bytes = 8;
        let result = setup.run(&native_payload("this pdf is larger than eight bytes")).await;
        assert_eq!(result.provenance, Provenance::Error("oversized".to_string()));
    }

    #[tokio::test]
    async fn test_parser_panic_is_contained() {
        let mut setup = Setup::new();
        setup.cloud = Some(Arc::new(FakeOcr::failing()));
        let payload = lib_utils::b64::encode(b"%PDF-1.4\nPANIC");
        let result = setup.run(&payload).await;
        assert!(result.provenance.is_error());
    }

    #[tokio::test]
    async fn test_output_is_truncated_with_marker() {
        let mut setup = Setup::new();
        setup.cfg.char_cap = 5;
        let result = setup.run(&scanned_payload()).await;
        assert_eq!(result.text, "cloud\n[TRUNCATED]");
        assert!(result.truncated);
    }

    /// Records free (cloud, cpu) permits at each step of a cloud OCR call.
    struct PermitSnapshots {
        pools: ExtractionPools,
        seen: std::sync::Mutex<Vec<(&'static str, usize, usize)>>,
    }

    impl PermitSnapshots {
        fn snapshot(&self, step: &'static str) {
            let free = (step, self.pools.cloud_available(), self.pools.cpu_available());
            self.seen.lock().unwrap().push(free);
        }
    }

    #[async_trait]
    impl CloudOcr for PermitSnapshots {
        async fn prepare(&self, pdf: &[u8]) -> PipelineResult<Vec<u8>> {
            self.snapshot("prepare");
            Ok(pdf.to_vec())
        }

        async fn ocr_prepared(&self, _upload: &[u8]) -> PipelineResult<String> {
            self.snapshot("ocr");
            Ok("page text".to_string())
        }
    }

    #[tokio::test]
    async fn test_rendering_holds_cpu_permit_not_cloud() {
        let pools = ExtractionPools::new(2, 2);
        let cloud = Arc::new(PermitSnapshots {
            pools: pools.clone(),
            seen: Default::default(),
        });
        let cascade = ExtractionCascade::new(
            ExtractionConfig::default(),
            Arc::new(FakeNative),
            Some(cloud.clone() as Arc<dyn CloudOcr>),
            None,
            pools,
            RetryPolicy::once(),
            Duration::from_millis(200),
        );
        let email = EmailRecord {
            attachment_names: vec!["scan.pdf".to_string()],
            attachment_payloads: vec![scanned_payload()],
            ..Default::default()
        };

        let result = cascade
            .extract(0, email.attachments()[0], &Deadline::new(Duration::from_secs(30)))
            .await;

        assert_eq!(result.provenance, Provenance::CloudOcr);
        assert_eq!(
            *cloud.seen.lock().unwrap(),
            vec![("prepare", 2, 1), ("ocr", 1, 2)]
        );
    }
}
