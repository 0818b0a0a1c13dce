//! Agent Configuration
//!
//! Static startup configuration: defaults, then an optional JSON file, then
//! `NL2SQL_*` environment variables. The CLI applies its flags last.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// SQL dialect used to parse and guard candidate queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Generic,
    Sqlite,
    BigQuery,
    Postgres,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Generic => "ANSI SQL",
            SqlDialect::Sqlite => "SQLite",
            SqlDialect::BigQuery => "GoogleSQL (BigQuery)",
            SqlDialect::Postgres => "PostgreSQL",
        }
    }
}

impl FromStr for SqlDialect {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "generic" | "ansi" => Ok(SqlDialect::Generic),
            "sqlite" => Ok(SqlDialect::Sqlite),
            "bigquery" | "googlesql" => Ok(SqlDialect::BigQuery),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            other => Err(AgentError::Config(format!("Unknown SQL dialect: {}", other))),
        }
    }
}

/// How candidates are synthesized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMethod {
    /// A single direct sample, no voting
    Baseline,
    /// Decomposition plus multi-sample synthesis with self-consistency voting
    Chase,
}

impl FromStr for GenerationMethod {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "BASELINE" => Ok(GenerationMethod::Baseline),
            "CHASE" => Ok(GenerationMethod::Chase),
            other => Err(AgentError::Config(format!("Unknown NL2SQL method: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier passed to the reasoning backend
    pub model: String,
    /// OpenAI-compatible API base URL
    pub api_base_url: String,
    /// Human-readable name of the warehouse dataset, used in prompts
    pub dataset: String,
    pub sql_dialect: SqlDialect,
    pub method: GenerationMethod,
    /// Decomposition candidates per question (Chase only)
    pub decomposition_candidates: usize,
    /// Direct samples per question (Chase only; Baseline always uses one)
    pub direct_samples: usize,
    pub max_repair_depth: usize,
    pub sandbox_retries: usize,
    pub executor_timeout_ms: u64,
    pub sandbox_timeout_ms: u64,
    /// Address-space ceiling of one sandbox run
    pub sandbox_memory_mb: u64,
    pub request_deadline_ms: u64,
    /// Row cap appended as LIMIT and enforced by the executor
    pub max_result_rows: usize,
    /// Rows rendered in the answer table
    pub answer_table_rows: usize,
    pub link_similarity_threshold: f64,
    pub max_linked_tables: usize,
    /// Absolute tolerance used when comparing numeric cells during voting
    pub numeric_tolerance: f64,
    pub temperature: f32,
    pub docs_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            dataset: "warehouse".to_string(),
            sql_dialect: SqlDialect::Sqlite,
            method: GenerationMethod::Chase,
            decomposition_candidates: 1,
            direct_samples: 2,
            max_repair_depth: 2,
            sandbox_retries: 1,
            executor_timeout_ms: 30_000,
            sandbox_timeout_ms: 60_000,
            sandbox_memory_mb: 2048,
            request_deadline_ms: 180_000,
            max_result_rows: 80,
            answer_table_rows: 20,
            link_similarity_threshold: 0.88,
            max_linked_tables: 8,
            numeric_tolerance: 1e-6,
            temperature: 0.1,
            docs_dir: None,
        }
    }
}

impl AgentConfig {
    /// Load defaults, an optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AgentError::Config(format!("Failed to read config {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    AgentError::Config(format!("Failed to parse config {}: {}", path.display(), e))
                })?
            }
            None => AgentConfig::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `NL2SQL_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("NL2SQL_MODEL") {
            self.model = v;
        }
        if let Some(v) = env_var("NL2SQL_API_BASE") {
            self.api_base_url = v;
        }
        if let Some(v) = env_var("NL2SQL_DATASET") {
            self.dataset = v;
        }
        if let Some(v) = env_parse("NL2SQL_DIALECT")? {
            self.sql_dialect = v;
        }
        if let Some(v) = env_parse("NL2SQL_METHOD")? {
            self.method = v;
        }
        if let Some(v) = env_parse("NL2SQL_DECOMPOSITION_CANDIDATES")? {
            self.decomposition_candidates = v;
        }
        if let Some(v) = env_parse("NL2SQL_DIRECT_SAMPLES")? {
            self.direct_samples = v;
        }
        if let Some(v) = env_parse("NL2SQL_MAX_REPAIR_DEPTH")? {
            self.max_repair_depth = v;
        }
        if let Some(v) = env_parse("NL2SQL_SANDBOX_RETRIES")? {
            self.sandbox_retries = v;
        }
        if let Some(v) = env_parse("NL2SQL_EXECUTOR_TIMEOUT_MS")? {
            self.executor_timeout_ms = v;
        }
        if let Some(v) = env_parse("NL2SQL_SANDBOX_TIMEOUT_MS")? {
            self.sandbox_timeout_ms = v;
        }
        if let Some(v) = env_parse("NL2SQL_SANDBOX_MEMORY_MB")? {
            self.sandbox_memory_mb = v;
        }
        if let Some(v) = env_parse("NL2SQL_REQUEST_DEADLINE_MS")? {
            self.request_deadline_ms = v;
        }
        if let Some(v) = env_parse("NL2SQL_MAX_RESULT_ROWS")? {
            self.max_result_rows = v;
        }
        if let Some(v) = env_var("NL2SQL_DOCS_DIR") {
            self.docs_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate_count() == 0 {
            return Err(AgentError::Config(
                "At least one candidate must be generated per question".to_string(),
            ));
        }
        if self.executor_timeout_ms == 0 || self.sandbox_timeout_ms == 0 || self.request_deadline_ms == 0 {
            return Err(AgentError::Config("Timeouts must be greater than zero".to_string()));
        }
        if self.max_result_rows == 0 {
            return Err(AgentError::Config("max_result_rows must be greater than zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.link_similarity_threshold) {
            return Err(AgentError::Config(format!(
                "link_similarity_threshold must be within [0, 1], got {}",
                self.link_similarity_threshold
            )));
        }
        if self.numeric_tolerance < 0.0 {
            return Err(AgentError::Config("numeric_tolerance must not be negative".to_string()));
        }
        Ok(())
    }

    /// Total fan-out N for one question
    pub fn candidate_count(&self) -> usize {
        match self.method {
            GenerationMethod::Baseline => 1,
            GenerationMethod::Chase => self.decomposition_candidates + self.direct_samples,
        }
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AgentError::Config(format!("Invalid value for {}: {}", key, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.candidate_count(), 3);
        assert_eq!(config.max_repair_depth, 2);
        assert_eq!(config.sandbox_retries, 1);
    }

    #[test]
    fn test_baseline_uses_single_candidate() {
        let config = AgentConfig {
            method: GenerationMethod::Baseline,
            direct_samples: 5,
            ..AgentConfig::default()
        };
        assert_eq!(config.candidate_count(), 1);
    }

    #[test]
    fn test_zero_fan_out_rejected() {
        let config = AgentConfig {
            decomposition_candidates: 0,
            direct_samples: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_partial_json_config_keeps_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"max_repair_depth": 3, "sql_dialect": "bigquery"}"#).unwrap();
        assert_eq!(config.max_repair_depth, 3);
        assert_eq!(config.sql_dialect, SqlDialect::BigQuery);
        assert_eq!(config.max_result_rows, 80);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("chase".parse::<GenerationMethod>().unwrap(), GenerationMethod::Chase);
        assert_eq!("BASELINE".parse::<GenerationMethod>().unwrap(), GenerationMethod::Baseline);
        assert!("magic".parse::<GenerationMethod>().is_err());
    }
}
