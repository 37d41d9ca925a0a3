use std::{future::Future, sync::Arc};

use anyhow::anyhow;
use tokio::sync::Semaphore;

use crate::error::{PipelineError, PipelineResult};

/// Two independent worker pools: network-bound cloud calls and CPU-bound
/// local work (native parsing, page rendering, tesseract). They are never
/// shared so a slow OCR API cannot starve local work or the other way round.
#[derive(Clone)]
pub struct ExtractionPools {
    cloud: Arc<Semaphore>,
    cpu: Arc<Semaphore>,
}

impl ExtractionPools {
    pub fn new(cloud_workers: usize, cpu_workers: usize) -> Self {
        tracing::debug!(
            "Extraction pools: {} cloud, {} cpu",
            cloud_workers,
            cpu_workers
        );
        Self {
            cloud: Arc::new(Semaphore::new(cloud_workers.max(1))),
            cpu: Arc::new(Semaphore::new(cpu_workers.max(1))),
        }
    }

    pub async fn run_cloud<T, F>(&self, fut: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        let _permit = self
            .cloud
            .acquire()
            .await
            .map_err(|e| PipelineError::Internal(anyhow!("cloud pool closed: {}", e)))?;
        fut.await
    }

    /// Async CPU work such as a subprocess that saturates a core.
    pub async fn run_local<T, F>(&self, fut: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        let _permit = self
            .cpu
            .acquire()
            .await
            .map_err(|e| PipelineError::Internal(anyhow!("cpu pool closed: {}", e)))?;
        fut.await
    }

    /// Blocking CPU work on the blocking thread pool. A panic inside `f`
    /// comes back as an error.
    pub async fn run_blocking<T, F>(&self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> PipelineResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .cpu
            .acquire()
            .await
            .map_err(|e| PipelineError::Internal(anyhow!("cpu pool closed: {}", e)))?;
        match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(PipelineError::Ocr("parser panicked".to_string())),
            Err(e) => Err(PipelineError::Internal(anyhow!("blocking task failed: {}", e))),
        }
    }

    #[cfg(test)]
    pub fn cloud_available(&self) -> usize {
        self.cloud.available_permits()
    }

    #[cfg(test)]
    pub fn cpu_available(&self) -> usize {
        self.cpu.available_permits()
    }
}
