mod batcher;
mod deadline;
mod error;
mod extract;
mod model;
mod observability;
mod orchestrator;
mod pipeline_config;
mod prompt;
mod rate_limiters;
mod state;
mod store;
mod testing;

use std::{env, sync::Arc};

use deadline::Deadline;
use extract::{
    CloudOcr, ExtractionCascade, ExtractionPools, LocalOcr, MistralOcr, PageRenderer,
    PdfTextLayer, TesseractOcr,
};
use mimalloc::MiMalloc;
use orchestrator::{LogOnlySignal, Orchestrator, PubSubSignal, ReinvocationSignal};
use pipeline_config::PipelineConfig;
use prompt::mistral::MistralClassifier;
use rate_limiters::RateLimiters;
use store::FsStore;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

fn init_tracing() {
    let json = env::var("DOCSIFT_LOG_JSON").is_ok_and(|v| v == "true");
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = PipelineConfig::load()?;
    tracing::info!("{}", cfg);
    if cfg.api.key.is_empty() {
        tracing::warn!("MISTRAL_API_KEY is not set, API calls will be rejected");
    }
    tracing::info!(
        "Token counts are {}",
        if tokenizer::is_exact() { "exact" } else { "estimated" }
    );

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;
    let rate_limiters = RateLimiters::from_config(&cfg.api);
    let renderer = PageRenderer::new(cfg.extraction.render_dpi);

    let cloud: Option<Arc<dyn CloudOcr>> = cfg.extraction.cloud_ocr_enabled.then(|| {
        Arc::new(MistralOcr::new(
            http_client.clone(),
            rate_limiters.clone(),
            renderer.clone(),
            &cfg.api.base_url,
            &cfg.api.key,
            &cfg.api.ocr_model,
        )) as Arc<dyn CloudOcr>
    });
    let local_enabled =
        cfg.extraction.prefer_local_ocr || cfg.extraction.local_fallback_on_cloud_error;
    let local: Option<Arc<dyn LocalOcr>> = local_enabled.then(|| {
        Arc::new(TesseractOcr::new(
            renderer.clone(),
            &cfg.extraction.tesseract_lang,
            cfg.extraction.tesseract_psm,
        )) as Arc<dyn LocalOcr>
    });

    let cascade = ExtractionCascade::new(
        cfg.extraction.clone(),
        Arc::new(PdfTextLayer),
        cloud,
        local,
        ExtractionPools::new(
            cfg.concurrency.cloud_ocr,
            cfg.concurrency.local_ocr_workers(),
        ),
        cfg.retry.policy(),
        cfg.orchestration.ocr_timeout(),
    );

    let classifier = Arc::new(MistralClassifier::new(
        http_client.clone(),
        rate_limiters.clone(),
        &cfg.api,
    ));

    let signal: Arc<dyn ReinvocationSignal> = match &cfg.signal.topic {
        Some(topic) => match PubSubSignal::connect(topic).await {
            Ok(signal) => Arc::new(signal),
            Err(e) => {
                tracing::error!("Pub/Sub unavailable, re-invocation will only be logged: {}", e);
                Arc::new(LogOnlySignal)
            }
        },
        None => Arc::new(LogOnlySignal),
    };

    let store = Arc::new(FsStore::new(cfg.storage.root.clone()));
    let orchestrator = Orchestrator::new(&cfg, store, cascade, classifier, signal);

    let deadline = Deadline::new(cfg.orchestration.budget());
    tokio::spawn(cancel_on_shutdown(deadline.clone()));

    let report = orchestrator.run_invocation(&deadline).await?;
    tracing::info!(
        "Invocation finished: {}",
        serde_json::to_string(&report).unwrap_or_default()
    );
    tracing::info!("Rate limiters at exit: {}", rate_limiters.get_status());
    Ok(())
}

/// Ctrl+C or SIGTERM stops new work; in-flight calls finish or become residue.
async fn cancel_on_shutdown(deadline: Deadline) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::warn!("Shutdown requested, finishing the current step");
    deadline.cancel();
}
