//! Shared fixtures for integration tests: a temporary SQLite warehouse, a
//! scripted reasoning model, a counting executor and a fake sandbox.

#![allow(dead_code)]

use async_trait::async_trait;
use nl2sql_agent::analytics::{CodeSandbox, SandboxFailure, SandboxOutput};
use nl2sql_agent::config::{AgentConfig, GenerationMethod};
use nl2sql_agent::docs::DocumentationStore;
use nl2sql_agent::execution::{ExecutionReport, QueryExecutor, SqliteExecutor};
use nl2sql_agent::llm::{ReasoningModel, ReasoningRequest, ReasoningTask};
use nl2sql_agent::orchestrator::Orchestrator;
use nl2sql_agent::schema::SchemaCatalog;
use nl2sql_agent::Result;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REVENUE_SQL: &str = "SELECT SUM(total_amount) AS revenue FROM orders \
     WHERE status = 'completed' AND order_date >= '2024-05-01' AND order_date < '2024-06-01'";

/// SQLite file removed on drop
pub struct TempWarehouse {
    pub path: PathBuf,
}

impl Drop for TempWarehouse {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

pub fn create_warehouse() -> TempWarehouse {
    let path = std::env::temp_dir().join(format!("nl2sql_it_{}.db", uuid::Uuid::new_v4()));
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             country TEXT
         );
         CREATE TABLE orders (
             id INTEGER PRIMARY KEY,
             customer_id INTEGER REFERENCES customers(id),
             total_amount REAL NOT NULL,
             order_date TEXT NOT NULL,
             status TEXT NOT NULL
         );
         INSERT INTO customers VALUES (1, 'Ada', 'UK'), (2, 'Lin', 'SG');
         INSERT INTO orders VALUES
             (1, 1, 100.0, '2024-05-03', 'completed'),
             (2, 2, 50.5, '2024-05-17', 'completed'),
             (3, 1, 20.0, '2024-05-20', 'cancelled'),
             (4, 2, 999.0, '2024-04-28', 'completed');",
    )
    .unwrap();
    TempWarehouse { path }
}

type Handler = dyn Fn(&ReasoningRequest) -> Result<String> + Send + Sync;

/// Reasoning model answering from a closure and recording every request
pub struct ScriptedModel {
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(ReasoningTask, String)>>,
}

impl ScriptedModel {
    pub fn new(handler: impl Fn(&ReasoningRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task: ReasoningTask) -> usize {
        self.calls.lock().unwrap().iter().filter(|(t, _)| *t == task).count()
    }

    /// Prompts sent for `task`, in call order
    pub fn prompts_for(&self, task: ReasoningTask) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        self.calls.lock().unwrap().push((request.task, request.prompt.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}

/// Wraps a real executor and counts the SQL that reaches it
pub struct CountingExecutor {
    inner: Arc<dyn QueryExecutor>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl CountingExecutor {
    pub fn new(inner: Arc<dyn QueryExecutor>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    async fn execute(&self, sql: &str) -> ExecutionReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(sql.to_string());
        self.inner.execute(sql).await
    }
}

/// Sandbox replaying queued results
pub struct FakeSandbox {
    responses: Mutex<VecDeque<std::result::Result<SandboxOutput, SandboxFailure>>>,
    calls: AtomicUsize,
}

impl FakeSandbox {
    pub fn new(responses: Vec<std::result::Result<SandboxOutput, SandboxFailure>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeSandbox for FakeSandbox {
    async fn run(&self, _code: &str, data: &Value) -> std::result::Result<SandboxOutput, SandboxFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(data.is_array(), "sandbox data must be a JSON array of rows");
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SandboxOutput::default()))
    }
}

pub fn test_config(method: GenerationMethod) -> AgentConfig {
    AgentConfig {
        method,
        decomposition_candidates: 1,
        direct_samples: 2,
        max_repair_depth: 2,
        sandbox_retries: 1,
        executor_timeout_ms: 5_000,
        sandbox_timeout_ms: 5_000,
        request_deadline_ms: 20_000,
        dataset: "shop".to_string(),
        ..AgentConfig::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub model: Arc<ScriptedModel>,
    pub executor: Arc<CountingExecutor>,
    pub sandbox: Arc<FakeSandbox>,
    pub warehouse: TempWarehouse,
}

pub fn harness(config: AgentConfig, model: ScriptedModel, sandbox: FakeSandbox) -> Harness {
    let warehouse = create_warehouse();
    let sqlite = Arc::new(SqliteExecutor::new(&warehouse.path, config.max_result_rows));
    let executor = Arc::new(CountingExecutor::new(sqlite.clone()));
    let model = Arc::new(model);
    let sandbox = Arc::new(sandbox);
    let docs = DocumentationStore::from_text(
        "## orders.md\n\nRevenue is the sum of total_amount over orders with status = 'completed'.",
    );

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(SchemaCatalog::new(sqlite)),
        Arc::new(docs),
        model.clone(),
        executor.clone(),
        sandbox.clone(),
    );
    Harness {
        orchestrator,
        model,
        executor,
        sandbox,
        warehouse,
    }
}
