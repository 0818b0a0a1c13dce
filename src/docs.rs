//! Documentation Context Store
//!
//! Loads human-authored schema and business documentation once per process
//! and hands out an immutable snapshot.

use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

const DOC_EXTENSIONS: &[&str] = &["md", "txt", "sql"];

/// Aggregated documentation blob
#[derive(Debug, Clone, Default)]
pub struct DocumentationContext {
    pub text: String,
    pub sources: Vec<PathBuf>,
}

impl DocumentationContext {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sources: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Blank-line separated paragraphs, used by the schema linker.
    pub fn paragraphs(&self) -> impl Iterator<Item = &str> {
        self.text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

pub struct DocumentationStore {
    dir: Option<PathBuf>,
    cache: OnceCell<Arc<DocumentationContext>>,
}

impl DocumentationStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cache: OnceCell::new(),
        }
    }

    /// Store pre-seeded with an in-memory blob
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            dir: None,
            cache: OnceCell::new_with(Some(Arc::new(DocumentationContext::from_text(text)))),
        }
    }

    /// Load (first call) or return the cached documentation snapshot.
    pub async fn load(&self) -> Result<Arc<DocumentationContext>> {
        self.cache
            .get_or_try_init(|| async {
                let context = match &self.dir {
                    Some(dir) => read_documentation_dir(dir).await?,
                    None => DocumentationContext::default(),
                };
                info!(
                    "Loaded documentation context: {} file(s), {} bytes",
                    context.sources.len(),
                    context.text.len()
                );
                Ok::<_, AgentError>(Arc::new(context))
            })
            .await
            .map(Arc::clone)
    }
}

async fn read_documentation_dir(dir: &Path) -> Result<DocumentationContext> {
    if !dir.is_dir() {
        warn!("Documentation directory {} not found, continuing without docs", dir.display());
        return Ok(DocumentationContext::default());
    }

    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_doc = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| DOC_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_doc && path.is_file() {
            paths.push(path);
        }
    }
    // Stable order keeps prompts reproducible across runs.
    paths.sort();

    let mut sections = Vec::with_capacity(paths.len());
    for path in &paths {
        let body = tokio::fs::read_to_string(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        sections.push(format!("## {}\n\n{}", name, body.trim()));
    }

    Ok(DocumentationContext {
        text: sections.join("\n\n"),
        sources: paths,
    })
}
