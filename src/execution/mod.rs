//! Query Execution
//!
//! The executor capability, the outcome taxonomy, and the guarded,
//! time-bounded wrapper every candidate goes through before it reaches the
//! warehouse.

pub mod error_classifier;
pub mod sqlite_engine;

use crate::generation::{CandidateId, CandidateQuery};
use crate::sql_guard::SqlGuard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use error_classifier::ErrorClassifier;
pub use sqlite_engine::SqliteExecutor;

/// How a single execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    SyntaxError,
    RuntimeError,
    EmptyResult,
    Timeout,
}

impl ExecutionStatus {
    /// Success and empty results carry rows (possibly none) and may win.
    pub fn is_viable(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::EmptyResult)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::SyntaxError => "syntax_error",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::EmptyResult => "empty_result",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Rows returned by a query, cells as JSON values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Set when the executor stopped at its row cap
    #[serde(default)]
    pub truncated: bool,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            truncated: false,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record: serde_json::Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(record)
            })
            .collect()
    }
}

/// What the executor reports for one SQL string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub result: Option<ResultSet>,
    pub error: Option<String>,
}

impl ExecutionReport {
    /// Rows came back; zero rows is flagged as `empty_result`.
    pub fn rows(result: ResultSet) -> Self {
        let status = if result.is_empty() {
            ExecutionStatus::EmptyResult
        } else {
            ExecutionStatus::Success
        };
        Self {
            status,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(status: ExecutionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn syntax_error(error: impl Into<String>) -> Self {
        Self::failure(ExecutionStatus::SyntaxError, error)
    }

    pub fn runtime_error(error: impl Into<String>) -> Self {
        Self::failure(ExecutionStatus::RuntimeError, error)
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self::failure(ExecutionStatus::Timeout, error)
    }
}

/// Read-only warehouse access
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run one read-only statement. Never fails at the Rust level; problems
    /// are reported through the returned status.
    async fn execute(&self, sql: &str) -> ExecutionReport;

    /// Backend name for logs
    fn name(&self) -> &str {
        "warehouse"
    }
}

/// One execution attempt of one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub candidate_id: CandidateId,
    pub status: ExecutionStatus,
    pub result: Option<ResultSet>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn from_report(candidate_id: CandidateId, report: ExecutionReport, elapsed_ms: u64) -> Self {
        Self {
            candidate_id,
            status: report.status,
            result: report.result,
            error: report.error,
            elapsed_ms,
            executed_at: Utc::now(),
        }
    }

    pub fn is_viable(&self) -> bool {
        self.status.is_viable()
    }

    /// Error text for repair prompts; falls back to the status label.
    pub fn error_detail(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| self.status.label().to_string())
    }
}

/// Guard, then execute under the per-call timeout.
///
/// Candidates the guard rejects are recorded as `syntax_error` without
/// touching the executor. Expiry of `timeout` drops the executor future,
/// which cancels the backend call.
pub async fn execute_candidate(
    executor: &dyn QueryExecutor,
    guard: &SqlGuard,
    candidate: &CandidateQuery,
    timeout: Duration,
) -> ExecutionOutcome {
    let start = Instant::now();

    if let Err(rejection) = guard.check(&candidate.sql) {
        warn!(
            "Candidate {} rejected before execution: {}",
            candidate.id, rejection
        );
        return ExecutionOutcome::from_report(
            candidate.id,
            ExecutionReport::syntax_error(rejection.to_string()),
            0,
        );
    }

    debug!("Executing candidate {} on {}:\n{}", candidate.id, executor.name(), candidate.sql);
    let report = match tokio::time::timeout(timeout, executor.execute(&candidate.sql)).await {
        Ok(report) => report,
        Err(_) => ExecutionReport::timeout(format!(
            "query exceeded the {}ms execution timeout",
            timeout.as_millis()
        )),
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    debug!(
        "Candidate {} finished with {} in {}ms",
        candidate.id, report.status, elapsed_ms
    );
    ExecutionOutcome::from_report(candidate.id, report, elapsed_ms)
}
