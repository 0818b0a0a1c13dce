//! Candidate Generator
//!
//! Produces several independent SQL hypotheses for one question. Two
//! strategies run concurrently:
//!
//! - decomposition: split the question, write a fragment per sub-question,
//!   compose the fragments into one query
//! - direct samples: whole queries written along different reasoning paths
//!   with increasing temperature
//!
//! Individual failures only shrink the pool.

use crate::agent_prompts::{
    build_compose_prompt, build_decomposition_prompt, build_direct_prompt, build_fragment_prompt,
    PromptContext,
};
use crate::config::{AgentConfig, GenerationMethod};
use crate::error::{AgentError, Result};
use crate::execution::ExecutionStatus;
use crate::llm::{ReasoningModel, ReasoningRequest, ReasoningTask};
use crate::sql_guard::{clean_generated_sql, extract_sql};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_SUB_QUESTIONS: usize = 5;
const TEMPERATURE_STEP: f32 = 0.2;
const MAX_TEMPERATURE: f32 = 1.0;

/// Generation ordinal of a candidate within its question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId(pub usize);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStrategy {
    Decomposition,
    DirectSample,
    Repair,
}

impl GenerationStrategy {
    /// Higher wins selection ties
    pub fn confidence(&self) -> u8 {
        match self {
            GenerationStrategy::Decomposition => 2,
            GenerationStrategy::DirectSample => 1,
            GenerationStrategy::Repair => 0,
        }
    }
}

/// How a direct sample was asked to reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPath {
    Direct,
    QueryPlan,
}

impl ReasoningPath {
    /// Paths rotate across samples so no two neighbours share one.
    pub fn for_sample(index: usize) -> Self {
        if index % 2 == 0 {
            ReasoningPath::Direct
        } else {
            ReasoningPath::QueryPlan
        }
    }
}

/// Where a candidate came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Decomposition {
        sub_questions: Vec<String>,
        fragments: Vec<String>,
    },
    Direct {
        path: ReasoningPath,
        temperature: f32,
    },
    Repair {
        parent: CandidateId,
        trigger: ExecutionStatus,
        depth: usize,
    },
}

/// One SQL hypothesis; immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub id: CandidateId,
    pub question_id: Uuid,
    pub sql: String,
    pub strategy: GenerationStrategy,
    pub provenance: Provenance,
}

#[derive(Debug, Clone)]
struct GeneratorSettings {
    method: GenerationMethod,
    decomposition_candidates: usize,
    direct_samples: usize,
    base_temperature: f32,
    max_result_rows: usize,
}

impl GeneratorSettings {
    fn from_config(config: &AgentConfig) -> Self {
        Self {
            method: config.method,
            decomposition_candidates: config.decomposition_candidates,
            direct_samples: config.direct_samples,
            base_temperature: config.temperature,
            max_result_rows: config.max_result_rows,
        }
    }

    fn temperature(&self, step: usize) -> f32 {
        (self.base_temperature + TEMPERATURE_STEP * step as f32).min(MAX_TEMPERATURE)
    }
}

enum Plan {
    Decomposition { sample: usize },
    Direct { sample: usize, path: ReasoningPath },
}

pub struct CandidateGenerator {
    model: Arc<dyn ReasoningModel>,
    settings: GeneratorSettings,
}

impl CandidateGenerator {
    pub fn new(model: Arc<dyn ReasoningModel>, config: &AgentConfig) -> Self {
        Self {
            model,
            settings: GeneratorSettings::from_config(config),
        }
    }

    /// Ordered generation plan; position in the plan is the candidate ordinal.
    fn plan(&self) -> Vec<Plan> {
        match self.settings.method {
            GenerationMethod::Baseline => vec![Plan::Direct {
                sample: 0,
                path: ReasoningPath::Direct,
            }],
            GenerationMethod::Chase => {
                let decompositions = (0..self.settings.decomposition_candidates)
                    .map(|sample| Plan::Decomposition { sample });
                let directs = (0..self.settings.direct_samples).map(|sample| Plan::Direct {
                    sample,
                    path: ReasoningPath::for_sample(sample),
                });
                decompositions.chain(directs).collect()
            }
        }
    }

    /// Generate all planned candidates concurrently.
    ///
    /// Returns candidates in ordinal order. Errors only when every planned
    /// generation failed.
    pub async fn generate(
        &self,
        question_id: Uuid,
        ctx: &PromptContext<'_>,
    ) -> Result<Vec<CandidateQuery>> {
        let plan = self.plan();
        let planned = plan.len();

        let attempts = plan.into_iter().enumerate().map(|(ordinal, step)| async move {
            let id = CandidateId(ordinal);
            let generated = match step {
                Plan::Decomposition { sample } => self.decompose(ctx, sample).await,
                Plan::Direct { sample, path } => self.direct(ctx, sample, path).await,
            };
            match generated {
                Ok((sql, strategy, provenance)) if !sql.is_empty() => Some(CandidateQuery {
                    id,
                    question_id,
                    sql,
                    strategy,
                    provenance,
                }),
                Ok(_) => {
                    warn!("Candidate {} came back empty, dropping it", id);
                    None
                }
                Err(e) => {
                    warn!("Candidate {} generation failed: {}", id, e);
                    None
                }
            }
        });

        let candidates: Vec<CandidateQuery> = join_all(attempts).await.into_iter().flatten().collect();

        info!("Generated {}/{} candidate(s)", candidates.len(), planned);
        if candidates.is_empty() {
            return Err(AgentError::Generation(format!(
                "All {} candidate generation(s) failed",
                planned
            )));
        }
        Ok(candidates)
    }

    async fn direct(
        &self,
        ctx: &PromptContext<'_>,
        sample: usize,
        path: ReasoningPath,
    ) -> Result<(String, GenerationStrategy, Provenance)> {
        let temperature = self.settings.temperature(sample);
        let request = ReasoningRequest::new(ReasoningTask::DirectSql, build_direct_prompt(ctx, path))
            .with_temperature(temperature)
            .with_sample(sample);
        let raw = self.model.complete(&request).await?;
        Ok((
            clean_generated_sql(&raw, self.settings.max_result_rows),
            GenerationStrategy::DirectSample,
            Provenance::Direct { path, temperature },
        ))
    }

    async fn decompose(
        &self,
        ctx: &PromptContext<'_>,
        sample: usize,
    ) -> Result<(String, GenerationStrategy, Provenance)> {
        let temperature = self.settings.temperature(sample);

        let request = ReasoningRequest::new(ReasoningTask::Decompose, build_decomposition_prompt(ctx))
            .with_temperature(temperature)
            .with_sample(sample);
        let mut sub_questions = parse_sub_questions(&self.model.complete(&request).await?);
        if sub_questions.is_empty() {
            sub_questions.push(ctx.question.to_string());
        }

        let fragment_calls = sub_questions.iter().enumerate().map(|(i, sub_question)| {
            let request = ReasoningRequest::new(
                ReasoningTask::Fragment,
                build_fragment_prompt(ctx, sub_question),
            )
            .with_temperature(temperature)
            .with_sample(sample * MAX_SUB_QUESTIONS + i);
            async move { self.model.complete(&request).await }
        });
        let fragments = join_all(fragment_calls)
            .await
            .into_iter()
            .map(|raw| raw.map(|r| extract_sql(&r)))
            .collect::<Result<Vec<String>>>()?;

        let request = ReasoningRequest::new(
            ReasoningTask::Compose,
            build_compose_prompt(ctx, &sub_questions, &fragments),
        )
        .with_temperature(temperature)
        .with_sample(sample);
        let raw = self.model.complete(&request).await?;

        Ok((
            clean_generated_sql(&raw, self.settings.max_result_rows),
            GenerationStrategy::Decomposition,
            Provenance::Decomposition {
                sub_questions,
                fragments,
            },
        ))
    }
}

/// One sub-question per non-empty line, list markers removed.
fn parse_sub_questions(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '-' | '*' | '.' | ')'))
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .take(MAX_SUB_QUESTIONS)
        .collect()
}
