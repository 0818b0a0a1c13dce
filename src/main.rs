use anyhow::{Context, Result};
use clap::Parser;
use nl2sql_agent::analytics::ProcessSandbox;
use nl2sql_agent::config::{AgentConfig, GenerationMethod, SqlDialect};
use nl2sql_agent::docs::DocumentationStore;
use nl2sql_agent::execution::SqliteExecutor;
use nl2sql_agent::llm::LlmClient;
use nl2sql_agent::orchestrator::Orchestrator;
use nl2sql_agent::schema::SchemaCatalog;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nl2sql-agent")]
#[command(about = "Answer natural-language questions over a SQL warehouse")]
struct Args {
    /// The question in natural language
    question: String,

    /// SQLite database file holding the warehouse
    #[arg(short, long)]
    database: PathBuf,

    /// Directory of schema / business documentation (.md, .txt, .sql)
    #[arg(long)]
    docs_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session identifier attached to logs
    #[arg(long, default_value = "cli")]
    session: String,

    /// SQL dialect override (sqlite, bigquery, postgres, generic)
    #[arg(long)]
    dialect: Option<SqlDialect>,

    /// Generation method override (BASELINE or CHASE)
    #[arg(long)]
    method: Option<GenerationMethod>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.docs_dir {
        config.docs_dir = Some(dir);
    }
    if let Some(dialect) = args.dialect {
        config.sql_dialect = dialect;
    }
    if let Some(method) = args.method {
        config.method = method;
    }
    config.validate()?;

    let api_key = args
        .api_key
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .context("No API key: pass --api-key or set OPENAI_API_KEY")?;

    info!("Warehouse: {}", args.database.display());
    let executor = Arc::new(SqliteExecutor::new(&args.database, config.max_result_rows));
    let catalog = Arc::new(SchemaCatalog::new(executor.clone()));
    let docs = Arc::new(DocumentationStore::new(config.docs_dir.clone()));
    let model = Arc::new(LlmClient::new(api_key, &config)?);
    let sandbox = ProcessSandbox::from_config(&config);
    if !sandbox.confinement().is_available() {
        warn!("bubblewrap (bwrap) not found; analysis questions will be refused");
    }
    let sandbox = Arc::new(sandbox);

    let orchestrator = Orchestrator::new(config, catalog, docs, model, executor, sandbox);
    let answer = orchestrator.answer(&args.question, &args.session).await;

    println!("{}", answer.text);

    if let Some(artifact) = &answer.artifact {
        let path = PathBuf::from(&artifact.name);
        std::fs::write(&path, &artifact.bytes)
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        info!("Wrote artifact {}", path.display());
    }

    Ok(())
}
