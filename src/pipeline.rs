//! SQL Pipeline
//!
//! generate → execute all (join barrier) → select → repair loop. Returns a
//! winning query that executed cleanly, or `RepairExhausted` once the repair
//! budget is spent. Never returns an unexecuted query.

use crate::agent_prompts::PromptContext;
use crate::config::AgentConfig;
use crate::correction::{QueryCorrector, RepairAttempt, RepairChain};
use crate::error::{AgentError, Result};
use crate::execution::{execute_candidate, ExecutionOutcome, QueryExecutor};
use crate::generation::{CandidateGenerator, CandidateId, CandidateQuery};
use crate::llm::ReasoningModel;
use crate::selection::{CandidateSelector, Selection};
use crate::sql_guard::SqlGuard;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal artifact of the pipeline
#[derive(Debug, Clone)]
pub struct WinningQuery {
    pub candidate: CandidateQuery,
    pub outcome: ExecutionOutcome,
    /// Candidates whose results agreed with the winner
    pub cluster: Vec<CandidateId>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub winner: WinningQuery,
    pub repair_chain: RepairChain,
    /// Every execution of this request, in completion order of the rounds
    pub executions: Vec<ExecutionOutcome>,
    pub candidates_generated: usize,
}

pub struct SqlPipeline {
    generator: CandidateGenerator,
    selector: CandidateSelector,
    corrector: QueryCorrector,
    executor: Arc<dyn QueryExecutor>,
    guard: SqlGuard,
    executor_timeout: Duration,
    max_repair_depth: usize,
}

impl SqlPipeline {
    pub fn new(
        config: &AgentConfig,
        model: Arc<dyn ReasoningModel>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            generator: CandidateGenerator::new(Arc::clone(&model), config),
            selector: CandidateSelector::new(config.numeric_tolerance, config.sql_dialect),
            corrector: QueryCorrector::new(model, config.max_result_rows, config.temperature),
            executor,
            guard: SqlGuard::new(config.sql_dialect),
            executor_timeout: config.executor_timeout(),
            max_repair_depth: config.max_repair_depth,
        }
    }

    async fn execute(&self, candidate: &CandidateQuery) -> ExecutionOutcome {
        execute_candidate(
            self.executor.as_ref(),
            &self.guard,
            candidate,
            self.executor_timeout,
        )
        .await
    }

    pub async fn run(&self, question_id: Uuid, ctx: &PromptContext<'_>) -> Result<PipelineReport> {
        let candidates = self.generator.generate(question_id, ctx).await?;
        let candidates_generated = candidates.len();

        let outcomes = join_all(candidates.iter().map(|c| self.execute(c))).await;
        let mut executions = outcomes.clone();
        let mut pool: Vec<(CandidateQuery, ExecutionOutcome)> =
            candidates.into_iter().zip(outcomes).collect();

        let mut chain = RepairChain::new(self.max_repair_depth);
        chain.mark_executed();
        let mut next_ordinal = pool.iter().map(|(c, _)| c.id.0 + 1).max().unwrap_or(0);
        // Failing tip of the repair lineage; the selector only picks the first target.
        let mut head: Option<(CandidateQuery, ExecutionOutcome)> = None;

        loop {
            let target = match self.selector.select(&pool) {
                Selection::Winner {
                    candidate,
                    outcome,
                    cluster,
                } => {
                    chain.accept();
                    info!(
                        "Accepted candidate {} after {} repair attempt(s)",
                        candidate.id,
                        chain.len()
                    );
                    return Ok(PipelineReport {
                        winner: WinningQuery {
                            candidate,
                            outcome,
                            cluster,
                        },
                        repair_chain: chain,
                        executions,
                        candidates_generated,
                    });
                }
                Selection::NoViableCandidate { repair_target } => head.take().or(repair_target),
            };

            let Some((original, trigger)) = target else {
                return Err(AgentError::Generation("No candidate to select or repair".to_string()));
            };

            if !chain.begin_repair() {
                chain.exhaust();
                warn!(
                    "Repair budget of {} exhausted; last failure: {}",
                    chain.max_depth(),
                    trigger.error_detail()
                );
                return Err(AgentError::RepairExhausted {
                    attempts: chain.len(),
                    last_error: trigger.error_detail(),
                });
            }

            let depth = chain.len() + 1;
            let id = CandidateId(next_ordinal);
            next_ordinal += 1;

            match self.corrector.revise(ctx, &original, &trigger, id, depth).await {
                Ok(revised) => {
                    let outcome = self.execute(&revised).await;
                    info!("Repair {} of candidate {} ended with {}", depth, original.id, outcome.status);
                    executions.push(outcome.clone());
                    chain.record(RepairAttempt {
                        original,
                        trigger,
                        revised: Some(revised.clone()),
                    });
                    if !outcome.is_viable() {
                        head = Some((revised.clone(), outcome.clone()));
                    }
                    pool.push((revised, outcome));
                }
                Err(e) => {
                    warn!("Repair {} of candidate {} failed to generate: {}", depth, original.id, e);
                    head = Some((original.clone(), trigger.clone()));
                    chain.record(RepairAttempt {
                        original,
                        trigger,
                        revised: None,
                    });
                }
            }
        }
    }
}
