use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::{
    client::{Client, ClientConfig},
    publisher::Publisher,
};
use serde_json::json;

use crate::error::{PipelineError, PipelineResult};

/// Asks the external scheduler for another invocation of a pipeline.
#[async_trait]
pub trait ReinvocationSignal: Send + Sync {
    async fn signal(&self, pipeline_id: &str) -> PipelineResult<()>;
}

/// Publishes `{"pipeline_id": ...}` to a Pub/Sub topic.
pub struct PubSubSignal {
    topic: String,
    publisher: Publisher,
}

impl PubSubSignal {
    pub async fn connect(topic: &str) -> PipelineResult<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| PipelineError::Signal(format!("pubsub auth: {}", e)))?;
        let client = Client::new(config)
            .await
            .map_err(|e| PipelineError::Signal(format!("pubsub client: {}", e)))?;
        let publisher = client.topic(topic).new_publisher(None);
        Ok(Self {
            topic: topic.to_string(),
            publisher,
        })
    }
}

#[async_trait]
impl ReinvocationSignal for PubSubSignal {
    async fn signal(&self, pipeline_id: &str) -> PipelineResult<()> {
        let message = PubsubMessage {
            data: json!({ "pipeline_id": pipeline_id }).to_string().into_bytes(),
            ..Default::default()
        };
        let message_id = self
            .publisher
            .publish(message)
            .await
            .get()
            .await
            .map_err(|e| PipelineError::Signal(format!("publish to {}: {}", self.topic, e)))?;
        tracing::info!(
            "Requested re-invocation of {} on {} (message {})",
            pipeline_id,
            self.topic,
            message_id
        );
        Ok(())
    }
}

/// Used when no topic is configured; an operator or cron re-runs the pipeline.
pub struct LogOnlySignal;

#[async_trait]
impl ReinvocationSignal for LogOnlySignal {
    async fn signal(&self, pipeline_id: &str) -> PipelineResult<()> {
        tracing::info!(
            "Pipeline {} has outstanding work, no topic configured to re-invoke it",
            pipeline_id
        );
        Ok(())
    }
}
