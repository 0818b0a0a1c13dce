//! Query Corrector
//!
//! Execution-guided repair. A failing candidate and its outcome go back to
//! the reasoning model together with the error; the revision joins the
//! candidate pool as a new candidate. The chain of attempts is bounded by
//! `max_repair_depth`.

use crate::agent_prompts::{build_repair_prompt, PromptContext};
use crate::error::{AgentError, Result};
use crate::execution::ExecutionOutcome;
use crate::generation::{CandidateId, CandidateQuery, GenerationStrategy, Provenance};
use crate::llm::{ReasoningModel, ReasoningRequest, ReasoningTask};
use crate::sql_guard::clean_generated_sql;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Lifecycle of one question's candidate lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Generated,
    Executed,
    Repairing { depth: usize },
    Accepted,
    Exhausted,
}

impl RepairState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RepairState::Accepted | RepairState::Exhausted)
    }
}

/// One repair step. `revised` is `None` when the model call itself failed;
/// the step still counts against the budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub original: CandidateQuery,
    pub trigger: ExecutionOutcome,
    pub revised: Option<CandidateQuery>,
}

/// Bounded chain of repair attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairChain {
    max_depth: usize,
    attempts: Vec<RepairAttempt>,
    state: RepairState,
}

impl RepairChain {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            attempts: Vec::new(),
            state: RepairState::Generated,
        }
    }

    pub fn state(&self) -> RepairState {
        self.state
    }

    pub fn attempts(&self) -> &[RepairAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn has_budget(&self) -> bool {
        !self.state.is_terminal() && self.attempts.len() < self.max_depth
    }

    pub fn mark_executed(&mut self) {
        if !self.state.is_terminal() {
            self.state = RepairState::Executed;
        }
    }

    /// Enter `Repairing` for the next step; `false` once the budget is spent.
    pub fn begin_repair(&mut self) -> bool {
        if !self.has_budget() {
            return false;
        }
        self.state = RepairState::Repairing {
            depth: self.attempts.len() + 1,
        };
        true
    }

    /// Record the finished step and move back to `Executed`.
    pub fn record(&mut self, attempt: RepairAttempt) {
        if self.attempts.len() < self.max_depth {
            self.attempts.push(attempt);
        }
        self.state = RepairState::Executed;
    }

    pub fn accept(&mut self) {
        self.state = RepairState::Accepted;
    }

    pub fn exhaust(&mut self) {
        self.state = RepairState::Exhausted;
    }
}

pub struct QueryCorrector {
    model: Arc<dyn ReasoningModel>,
    max_result_rows: usize,
    temperature: f32,
}

impl QueryCorrector {
    pub fn new(model: Arc<dyn ReasoningModel>, max_result_rows: usize, temperature: f32) -> Self {
        Self {
            model,
            max_result_rows,
            temperature,
        }
    }

    /// Ask for a revision of `original` conditioned on its failure.
    pub async fn revise(
        &self,
        ctx: &PromptContext<'_>,
        original: &CandidateQuery,
        trigger: &ExecutionOutcome,
        id: CandidateId,
        depth: usize,
    ) -> Result<CandidateQuery> {
        info!(
            "Repairing candidate {} ({}) at depth {}",
            original.id, trigger.status, depth
        );

        let prompt = build_repair_prompt(
            ctx,
            &original.sql,
            trigger.status.label(),
            &trigger.error_detail(),
        );
        let request = ReasoningRequest::new(ReasoningTask::RepairSql, prompt)
            .with_temperature(self.temperature)
            .with_sample(depth);
        let raw = self.model.complete(&request).await?;

        let sql = clean_generated_sql(&raw, self.max_result_rows);
        if sql.is_empty() {
            return Err(AgentError::Generation(format!(
                "Repair of candidate {} returned no SQL",
                original.id
            )));
        }

        Ok(CandidateQuery {
            id,
            question_id: original.question_id,
            sql,
            strategy: GenerationStrategy::Repair,
            provenance: Provenance::Repair {
                parent: original.id,
                trigger: trigger.status,
                depth,
            },
        })
    }
}
