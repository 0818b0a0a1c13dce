pub mod agent_prompts;
pub mod analytics;
pub mod config;
pub mod correction;
pub mod docs;
pub mod error;
pub mod execution;
pub mod generation;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod schema;
pub mod selection;
pub mod sql_guard;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use orchestrator::{AnswerResult, AnswerStatus, Orchestrator};
