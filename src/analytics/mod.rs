//! Analytics Engine
//!
//! Turns an analysis instruction plus the winning result set into Python
//! code and runs it through the sandbox. A failed run is retried with the
//! error fed back into generation, up to `sandbox_retries` times.

pub mod sandbox;

use crate::agent_prompts::build_analytics_prompt;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::execution::ResultSet;
use crate::llm::{ReasoningModel, ReasoningRequest, ReasoningTask};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use sandbox::{
    Artifact, CodeSandbox, Confinement, ProcessSandbox, ResourceLimits, SandboxFailure, SandboxFailureKind,
    SandboxOutput,
};

const PREVIEW_ROWS: usize = 5;

lazy_static! {
    static ref PYTHON_BLOCK: Regex = Regex::new(r"(?is)```[ \t]*(?:python3|python|py)?[ \t]*\r?\n(.*?)```").unwrap();
}

/// Follow-up analysis over a result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsTask {
    pub instruction: String,
    pub input: ResultSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Succeeded,
    Failed,
}

/// Terminal artifact of the analytics engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsOutcome {
    /// Code of the final attempt
    pub code: String,
    pub status: SandboxStatus,
    pub output: SandboxOutput,
    pub attempts: usize,
}

impl AnalyticsOutcome {
    /// First image artifact, if any
    pub fn chart(&self) -> Option<&Artifact> {
        self.output.artifacts.iter().find(|a| a.is_image())
    }
}

pub struct AnalyticsEngine {
    model: Arc<dyn ReasoningModel>,
    sandbox: Arc<dyn CodeSandbox>,
    retries: usize,
    timeout: Duration,
    temperature: f32,
}

impl AnalyticsEngine {
    pub fn new(model: Arc<dyn ReasoningModel>, sandbox: Arc<dyn CodeSandbox>, config: &AgentConfig) -> Self {
        Self {
            model,
            sandbox,
            retries: config.sandbox_retries,
            timeout: config.sandbox_timeout(),
            temperature: config.temperature,
        }
    }

    pub async fn run(&self, task: &AnalyticsTask) -> Result<AnalyticsOutcome> {
        let data = Value::Array(task.input.to_records());
        let preview = match &data {
            Value::Array(records) => serde_json::to_string_pretty(
                &records.iter().take(PREVIEW_ROWS).collect::<Vec<_>>(),
            )?,
            _ => String::new(),
        };

        let mut last_failure: Option<(String, SandboxFailure)> = None;

        for attempt in 0..=self.retries {
            let prompt = build_analytics_prompt(
                &task.instruction,
                &task.input.columns,
                &preview,
                task.input.row_count(),
                last_failure
                    .as_ref()
                    .map(|(code, failure)| (code.as_str(), failure.message.as_str())),
            );
            let request = ReasoningRequest::new(ReasoningTask::AnalyticsCode, prompt)
                .with_temperature(self.temperature)
                .with_sample(attempt);
            let code = extract_code(&self.model.complete(&request).await?);

            let run = match tokio::time::timeout(self.timeout, self.sandbox.run(&code, &data)).await {
                Ok(run) => run,
                Err(_) => Err(SandboxFailure::new(
                    SandboxFailureKind::Timeout,
                    format!("sandbox call exceeded {}ms", self.timeout.as_millis()),
                )),
            };

            match run {
                Ok(output) => {
                    info!(
                        "Analytics succeeded on attempt {} with {} artifact(s)",
                        attempt + 1,
                        output.artifacts.len()
                    );
                    return Ok(AnalyticsOutcome {
                        code,
                        status: SandboxStatus::Succeeded,
                        output,
                        attempts: attempt + 1,
                    });
                }
                Err(failure) => {
                    warn!("Analytics attempt {} failed: {}", attempt + 1, failure);
                    last_failure = Some((code, failure));
                }
            }
        }

        let message = last_failure
            .map(|(_, failure)| failure.to_string())
            .unwrap_or_else(|| "no attempt was made".to_string());
        Err(AgentError::Sandbox(format!(
            "analysis failed after {} attempt(s): {}",
            self.retries + 1,
            message
        )))
    }
}

/// Code inside the first fenced block, or the whole reply.
fn extract_code(raw: &str) -> String {
    match PYTHON_BLOCK.captures(raw).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => raw.trim().to_string(),
    }
}
