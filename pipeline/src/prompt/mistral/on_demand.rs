use async_trait::async_trait;
use serde_json::json;

use crate::{
    batcher::ClassificationUnit,
    error::{PipelineError, PipelineResult},
    model::RawClassification,
    pipeline_config::ApiConfig,
    prompt::{
        classification_system_prompt, classification_user_prompt, relevance_system_prompt,
        relevance_user_prompt, DocumentClassifier, RelevanceItem, RelevanceVerdict,
        CLASSIFICATION_PROMPT_TOKENS,
    },
    rate_limiters::RateLimiters,
    HttpClient,
};

use super::{parse_classification_answer, parse_relevance_answer, ChatApiResponseOrError};

const RATE_LIMIT_MESSAGE: &str = "Requests rate limit exceeded";

/// Chat-completions classifier with JSON-object responses.
pub struct MistralClassifier {
    http_client: HttpClient,
    rate_limiters: RateLimiters,
    endpoint: String,
    api_key: String,
    chat_model: String,
    relevance_model: String,
    temperature: f64,
}

impl MistralClassifier {
    pub fn new(http_client: HttpClient, rate_limiters: RateLimiters, api: &ApiConfig) -> Self {
        Self {
            http_client,
            rate_limiters,
            endpoint: format!(
                "{}/v1/chat/completions",
                api.base_url.trim_end_matches('/')
            ),
            api_key: api.key.clone(),
            chat_model: api.chat_model.clone(),
            relevance_model: api.relevance_model.clone(),
            temperature: api.temperature,
        }
    }

    async fn send_prompt(
        &self,
        model: &str,
        system_prompt: String,
        user_content: String,
        estimated_tokens: usize,
    ) -> PipelineResult<String> {
        self.rate_limiters.acquire_one().await;
        self.rate_limiters.acquire_tokens(estimated_tokens).await;

        let resp = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!(
              {
                "model": model,
                "temperature": self.temperature,
                "messages": [
                  {
                    "role": "system",
                    "content": system_prompt
                  },
                  {
                    "role": "user",
                    "content": user_content
                  }
                ],
                "response_format": {
                    "type": "json_object",
                }
              }
            ))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        let parsed = serde_json::from_str::<ChatApiResponseOrError>(&body).map_err(|e| {
            if status.is_success() {
                PipelineError::InvalidResponse(format!("could not parse chat response: {}", e))
            } else {
                PipelineError::from_status(status, &body)
            }
        })?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(error) => {
                if error.message == RATE_LIMIT_MESSAGE {
                    self.rate_limiters.trigger_backoff();
                    return Err(PipelineError::RateLimited(error.message));
                }
                if !status.is_success() {
                    return Err(PipelineError::from_status(status, &error.message));
                }
                return Err(PipelineError::Api(error.message));
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        tracing::debug!(
            "Chat usage: {} prompt / {} completion tokens",
            parsed.usage.prompt_tokens,
            parsed.usage.completion_tokens
        );

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::InvalidResponse("no choices in response".to_string()))
    }
}

#[async_trait]
impl DocumentClassifier for MistralClassifier {
    async fn classify(&self, unit: &ClassificationUnit) -> PipelineResult<Vec<RawClassification>> {
        let estimated_tokens = unit.estimated_tokens + *CLASSIFICATION_PROMPT_TOKENS;
        let content = self
            .send_prompt(
                &self.chat_model,
                classification_system_prompt(),
                classification_user_prompt(unit),
                estimated_tokens,
            )
            .await?;
        parse_classification_answer(&content)
    }

    async fn screen(&self, items: &[RelevanceItem]) -> PipelineResult<Vec<RelevanceVerdict>> {
        let user_content = relevance_user_prompt(items);
        let estimated_tokens = tokenizer::estimate_tokens(&user_content) + 200;
        let content = self
            .send_prompt(
                &self.relevance_model,
                relevance_system_prompt(),
                user_content,
                estimated_tokens,
            )
            .await?;
        parse_relevance_answer(&content)
    }
}
