//! Orchestrator
//!
//! Root of a request: question → schema linking → SQL pipeline → optional
//! analytics → composed answer. Every request runs under the configured
//! deadline; on expiry the in-flight work is dropped, which cancels any
//! running executor or sandbox call.

use crate::agent_prompts::PromptContext;
use crate::analytics::{AnalyticsEngine, AnalyticsOutcome, AnalyticsTask, Artifact, CodeSandbox};
use crate::config::AgentConfig;
use crate::docs::DocumentationStore;
use crate::error::{AgentError, Result};
use crate::execution::{ExecutionStatus, QueryExecutor, ResultSet};
use crate::llm::ReasoningModel;
use crate::pipeline::{PipelineReport, SqlPipeline};
use crate::schema::linker::SchemaLinker;
use crate::schema::{SchemaCatalog, SchemaContext};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

lazy_static! {
    static ref ANALYTICS_INTENT: Regex = Regex::new(
        r"(?i)\b(plot|chart|graph|visuali[sz]\w*|histogram|trend\w*|forecast\w*|predict\w*|correlat\w*|regression|distribution|outlier\w*|moving average|percent(age)? change|growth rate|seasonal\w*|cluster\w*)\b"
    )
    .unwrap();
}

const UNABLE_TO_ANSWER: &str =
    "I'm sorry, I was unable to answer this question from the data warehouse. \
     Try rephrasing it or naming the tables and columns you are interested in.";

/// One incoming question; immutable for the lifetime of the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    pub session_id: String,
    pub received_at: DateTime<Utc>,
}

impl Question {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            session_id: session_id.into(),
            received_at: Utc::now(),
        }
    }
}

/// What happens after the SQL pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    SqlOnly,
    Analytics { instruction: String },
}

/// Decide from the question wording whether follow-up analysis is needed.
pub fn decide_route(question: &str) -> Route {
    if ANALYTICS_INTENT.is_match(question) {
        Route::Analytics {
            instruction: question.trim().to_string(),
        }
    } else {
        Route::SqlOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    NeedsClarification,
    Unanswerable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResult {
    pub request_id: Uuid,
    pub status: AnswerStatus,
    /// Markdown answer for the user
    pub text: String,
    pub sql: Option<String>,
    pub execution_status: Option<ExecutionStatus>,
    pub repair_attempts: usize,
    pub artifact: Option<Artifact>,
}

impl AnswerResult {
    fn unanswerable(request_id: Uuid) -> Self {
        Self {
            request_id,
            status: AnswerStatus::Unanswerable,
            text: UNABLE_TO_ANSWER.to_string(),
            sql: None,
            execution_status: None,
            repair_attempts: 0,
            artifact: None,
        }
    }
}

pub struct Orchestrator {
    config: AgentConfig,
    catalog: Arc<SchemaCatalog>,
    docs: Arc<DocumentationStore>,
    linker: SchemaLinker,
    pipeline: SqlPipeline,
    analytics: AnalyticsEngine,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        catalog: Arc<SchemaCatalog>,
        docs: Arc<DocumentationStore>,
        model: Arc<dyn ReasoningModel>,
        executor: Arc<dyn QueryExecutor>,
        sandbox: Arc<dyn CodeSandbox>,
    ) -> Self {
        Self {
            linker: SchemaLinker::from_config(&config),
            pipeline: SqlPipeline::new(&config, Arc::clone(&model), executor),
            analytics: AnalyticsEngine::new(model, sandbox, &config),
            config,
            catalog,
            docs,
        }
    }

    /// Drop the cached schema; the next request describes the warehouse again.
    pub async fn invalidate_schema(&self) {
        self.catalog.invalidate().await;
    }

    /// Answer one question. Never fails: errors become a user-facing
    /// clarification or "unable to answer" response.
    pub async fn answer(&self, question: &str, session_id: &str) -> AnswerResult {
        let question = Question::new(question, session_id);
        let span = info_span!(
            "request",
            request_id = %question.id,
            session_id = %question.session_id
        );
        let deadline = self.config.request_deadline();

        async {
            info!("Question received: {}", question.text);
            let result = match tokio::time::timeout(deadline, self.handle(&question)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Deadline(self.config.request_deadline_ms)),
            };
            match result {
                Ok(answer) => {
                    info!("Request finished with {:?}", answer.status);
                    answer
                }
                Err(e) => {
                    error!(kind = e.kind(), "Request failed: {}", e);
                    AnswerResult::unanswerable(question.id)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, question: &Question) -> Result<AnswerResult> {
        let snapshot = self.catalog.snapshot().await?;
        let docs = self.docs.load().await?;

        let linked = match self.linker.link(&question.text, &snapshot.context, &docs) {
            Ok(linked) => linked,
            Err(AgentError::SchemaLink(reason)) => {
                warn!("Schema linking found nothing: {}", reason);
                return Ok(clarification(question.id, &snapshot.context));
            }
            Err(e) => return Err(e),
        };
        info!(
            "Linked {} table(s) from schema v{}: {}",
            linked.tables.len(),
            snapshot.version,
            linked.table_names().join(", ")
        );

        let route = decide_route(&question.text);
        let schema_ddl = linked.context.render_ddl();
        let ctx = PromptContext {
            question: &question.text,
            dataset: &self.config.dataset,
            dialect: self.config.sql_dialect,
            schema_ddl: &schema_ddl,
            documentation: &docs.text,
        };

        let report = self.pipeline.run(question.id, &ctx).await?;

        let analysis = match (&route, report.winner.outcome.result.as_ref()) {
            (Route::Analytics { instruction }, Some(rows)) if !rows.is_empty() => {
                info!("Routing winning rows to analytics");
                let task = AnalyticsTask {
                    instruction: instruction.clone(),
                    input: rows.clone(),
                };
                Some(self.analytics.run(&task).await?)
            }
            (Route::Analytics { .. }, _) => {
                info!("Skipping analytics: the winning query returned no rows");
                None
            }
            (Route::SqlOnly, _) => None,
        };

        Ok(self.compose(question.id, &report, analysis))
    }

    fn compose(
        &self,
        request_id: Uuid,
        report: &PipelineReport,
        analysis: Option<AnalyticsOutcome>,
    ) -> AnswerResult {
        let winner = &report.winner;
        let empty = ResultSet::default();
        let rows = winner.outcome.result.as_ref().unwrap_or(&empty);

        let mut text = format!("**Result:** {}\n\n", summarize(rows));
        if !rows.is_empty() {
            text.push_str("**Table:**\n\n");
            text.push_str(&markdown_table(rows, self.config.answer_table_rows));
            text.push('\n');
        }
        text.push_str(&format!(
            "**Explanation:** The answer comes from this query:\n\n```sql\n{}\n```\n",
            winner.candidate.sql
        ));

        let mut artifact = None;
        if let Some(analysis) = analysis {
            text.push_str(&format!("\n**Analysis:**\n\n{}\n", analysis.output.stdout.trim()));
            artifact = analysis
                .chart()
                .or_else(|| analysis.output.artifacts.first())
                .cloned();
            if let Some(artifact) = &artifact {
                text.push_str(&format!("\nAttached: `{}`\n", artifact.name));
            }
        }

        AnswerResult {
            request_id,
            status: AnswerStatus::Answered,
            text,
            sql: Some(winner.candidate.sql.clone()),
            execution_status: Some(winner.outcome.status),
            repair_attempts: report.repair_chain.len(),
            artifact,
        }
    }
}

fn clarification(request_id: Uuid, schema: &SchemaContext) -> AnswerResult {
    let mut text = String::from(
        "I couldn't match your question to any table in the warehouse. \
         Could you rephrase it using one of the available tables?\n",
    );
    for name in schema.table_names() {
        text.push_str(&format!("\n- {}", name));
    }
    AnswerResult {
        request_id,
        status: AnswerStatus::NeedsClarification,
        text,
        sql: None,
        execution_status: None,
        repair_attempts: 0,
        artifact: None,
    }
}

fn summarize(rows: &ResultSet) -> String {
    match (rows.row_count(), rows.columns.len()) {
        (0, _) => "The query ran successfully but returned no rows.".to_string(),
        (1, 1) => format!("{} = {}", rows.columns[0], cell_text(&rows.rows[0][0])),
        (n, _) if rows.truncated => format!("Showing the first {} rows (result truncated).", n),
        (n, _) => format!("The query returned {} row(s).", n),
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn markdown_table(rows: &ResultSet, max_rows: usize) -> String {
    let escape = |s: String| s.replace('|', "\\|").replace('\n', " ");
    let mut table = format!(
        "| {} |\n|{}|\n",
        rows.columns.iter().map(|c| escape(c.clone())).join(" | "),
        vec!["---"; rows.columns.len()].join("|")
    );
    for row in rows.rows.iter().take(max_rows) {
        let cells = row.iter().map(|v| escape(cell_text(v))).join(" | ");
        table.push_str(&format!("| {} |\n", cells));
    }
    if rows.row_count() > max_rows {
        table.push_str(&format!("\n_Showing {} of {} rows._\n", max_rows, rows.row_count()));
    }
    table
}
