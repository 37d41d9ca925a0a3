pub mod on_demand;

pub use on_demand::MistralClassifier;

use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, PipelineResult},
    model::RawClassification,
};

use super::RelevanceVerdict;

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ModelLength,
    Error,
    ToolCalls,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: PromptUsage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResultsEnvelope<T> {
    Wrapped { results: Vec<T> },
    Bare(Vec<T>),
}

fn parse_results<T: serde::de::DeserializeOwned>(content: &str) -> PipelineResult<Vec<T>> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    match serde_json::from_str::<ResultsEnvelope<T>>(trimmed) {
        Ok(ResultsEnvelope::Wrapped { results }) | Ok(ResultsEnvelope::Bare(results)) => Ok(results),
        Err(e) => Err(PipelineError::InvalidResponse(format!(
            "could not parse model answer ({}): {}",
            e,
            content.chars().take(200).collect::<String>()
        ))),
    }
}

/// Parse the model's JSON answer into per-thread classification entries.
pub fn parse_classification_answer(content: &str) -> PipelineResult<Vec<RawClassification>> {
    parse_results(content)
}

pub fn parse_relevance_answer(content: &str) -> PipelineResult<Vec<RelevanceVerdict>> {
    parse_results(content)
}
