//! Reasoning Backend
//!
//! Every generation step (candidate synthesis, repair, analytics code) is a
//! call through [`ReasoningModel`]. The crate makes no assumption about the
//! returned text beyond "best-effort string"; callers post-process it.

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Which generation step a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasoningTask {
    /// Split a question into sub-questions
    Decompose,
    /// Write a SQL fragment for one sub-question
    Fragment,
    /// Assemble fragments into a final query
    Compose,
    /// Write a whole query in one pass
    DirectSql,
    /// Rewrite a failing query given its error
    RepairSql,
    /// Write analysis code over a result set
    AnalyticsCode,
}

#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub task: ReasoningTask,
    pub prompt: String,
    pub temperature: f32,
    /// Distinguishes independent samples of the same task
    pub sample_index: usize,
}

impl ReasoningRequest {
    pub fn new(task: ReasoningTask, prompt: String) -> Self {
        Self {
            task,
            prompt,
            temperature: 0.1,
            sample_index: 0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_sample(mut self, sample_index: usize) -> Self {
        self.sample_index = sample_index;
        self
    }
}

/// Text-generation capability behind every synthesis step
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String>;
}

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, config: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_deadline_ms))
            .build()
            .map_err(|e| AgentError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            http,
        })
    }

    fn system_prompt(task: ReasoningTask) -> &'static str {
        match task {
            ReasoningTask::Decompose => {
                "You split data questions into short, independent sub-questions. Return one sub-question per line."
            }
            ReasoningTask::Fragment | ReasoningTask::Compose | ReasoningTask::DirectSql => {
                "You are an expert SQL writer. Return only a single read-only SQL query, no commentary."
            }
            ReasoningTask::RepairSql => {
                "You fix SQL queries. Return only the corrected SQL query, no commentary."
            }
            ReasoningTask::AnalyticsCode => {
                "You write short, self-contained Python analysis scripts. Return only code."
            }
        }
    }
}

#[async_trait]
impl ReasoningModel for LlmClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": Self::system_prompt(request.task)},
                {"role": "user", "content": request.prompt}
            ],
            "temperature": request.temperature,
            "max_tokens": 2000
        });

        debug!(task = ?request.task, sample = request.sample_index, "calling reasoning backend");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if !status.is_success() {
            let message = response_json["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(AgentError::Llm(format!("LLM API returned {}: {}", status, message)));
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Llm("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}
