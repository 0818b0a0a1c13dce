use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Schema link error: {0}")]
    SchemaLink(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Repair exhausted after {attempts} attempt(s): {last_error}")]
    RepairExhausted { attempts: usize, last_error: String },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Request deadline of {0}ms exceeded")]
    Deadline(u64),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Stable category label used in logs and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::SchemaLink(_) => "schema_link",
            AgentError::Generation(_) => "generation",
            AgentError::Execution(_) => "execution",
            AgentError::RepairExhausted { .. } => "repair_exhausted",
            AgentError::Sandbox(_) => "sandbox",
            AgentError::Deadline(_) => "deadline",
            AgentError::Llm(_) => "llm",
            AgentError::Config(_) => "config",
            AgentError::Io(_) => "io",
            AgentError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
