mod common;

use common::*;
use nl2sql_agent::agent_prompts::PromptContext;
use nl2sql_agent::config::{GenerationMethod, SqlDialect};
use nl2sql_agent::correction::RepairState;
use nl2sql_agent::execution::SqliteExecutor;
use nl2sql_agent::llm::ReasoningTask;
use nl2sql_agent::pipeline::SqlPipeline;
use nl2sql_agent::AgentError;
use std::sync::Arc;
use uuid::Uuid;

fn ctx() -> PromptContext<'static> {
    PromptContext {
        question: "What was the total revenue last month?",
        dataset: "shop",
        dialect: SqlDialect::Sqlite,
        schema_ddl: "CREATE TABLE orders (id INTEGER, total_amount REAL, order_date TEXT, status TEXT);",
        documentation: "",
    }
}

fn executor(warehouse: &TempWarehouse) -> Arc<CountingExecutor> {
    Arc::new(CountingExecutor::new(Arc::new(SqliteExecutor::new(&warehouse.path, 80))))
}

#[tokio::test]
async fn test_repair_exhausted_after_exactly_max_depth() {
    for depth in [0usize, 1, 3] {
        let warehouse = create_warehouse();
        let executor = executor(&warehouse);
        let model = Arc::new(ScriptedModel::new(|req| match req.task {
            ReasoningTask::DirectSql => Ok("SELECT missing_column FROM orders".to_string()),
            ReasoningTask::RepairSql => Ok("SELECT still_missing FROM orders".to_string()),
            other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
        }));
        let mut config = test_config(GenerationMethod::Baseline);
        config.max_repair_depth = depth;
        let pipeline = SqlPipeline::new(&config, model.clone(), executor.clone());

        match pipeline.run(Uuid::new_v4(), &ctx()).await {
            Err(AgentError::RepairExhausted { attempts, last_error }) => {
                assert_eq!(attempts, depth);
                assert!(last_error.contains("no such column"));
            }
            other => panic!("expected RepairExhausted, got {:?}", other.map(|r| r.winner.candidate.sql)),
        }
        assert_eq!(model.calls_for(ReasoningTask::RepairSql), depth);
        assert_eq!(executor.calls(), depth + 1);
    }
}

#[tokio::test]
async fn test_failed_repair_generation_consumes_budget() {
    let warehouse = create_warehouse();
    let executor = executor(&warehouse);
    let model = Arc::new(ScriptedModel::new(|req| match req.task {
        ReasoningTask::DirectSql => Ok("SELECT nope FROM orders".to_string()),
        _ => Err(AgentError::Llm("backend unavailable".to_string())),
    }));
    let pipeline = SqlPipeline::new(&test_config(GenerationMethod::Baseline), model.clone(), executor.clone());

    let err = pipeline.run(Uuid::new_v4(), &ctx()).await.unwrap_err();
    assert!(matches!(err, AgentError::RepairExhausted { attempts: 2, .. }));
    assert_eq!(model.calls_for(ReasoningTask::RepairSql), 2);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_winner_is_always_an_executed_viable_candidate() {
    let warehouse = create_warehouse();
    let executor = executor(&warehouse);
    let model = Arc::new(ScriptedModel::new(|req| match req.task {
        ReasoningTask::Decompose => Ok("completed orders in May".to_string()),
        ReasoningTask::Fragment => Ok("SELECT * FROM orders WHERE status = 'completed'".to_string()),
        // Write statements are refused before execution.
        ReasoningTask::Compose => Ok("DELETE FROM orders".to_string()),
        ReasoningTask::DirectSql if req.sample_index == 0 => Ok("SELECT COUNT(*) FROM orderz".to_string()),
        ReasoningTask::DirectSql => Ok(REVENUE_SQL.to_string()),
        other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
    }));
    let pipeline = SqlPipeline::new(&test_config(GenerationMethod::Chase), model.clone(), executor.clone());

    let report = pipeline.run(Uuid::new_v4(), &ctx()).await.unwrap();

    assert!(report.winner.outcome.is_viable());
    assert_eq!(report.winner.candidate.id, report.winner.outcome.candidate_id);
    assert!(report
        .executions
        .iter()
        .any(|o| o.candidate_id == report.winner.candidate.id));
    assert_eq!(report.candidates_generated, 3);
    assert_eq!(report.repair_chain.state(), RepairState::Accepted);
    assert!(report.repair_chain.is_empty());
    // DELETE never reached the warehouse.
    assert!(executor.seen().iter().all(|sql| !sql.contains("DELETE")));
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_repair_chain_recorded_on_success() {
    let warehouse = create_warehouse();
    let executor = executor(&warehouse);
    let model = Arc::new(ScriptedModel::new(|req| match req.task {
        ReasoningTask::DirectSql => Ok("SELECT SUM(amount) FROM orders".to_string()),
        ReasoningTask::RepairSql if req.sample_index == 1 => Ok("SELECT SUM(amt) FROM orders".to_string()),
        ReasoningTask::RepairSql => Ok(REVENUE_SQL.to_string()),
        other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
    }));
    let pipeline = SqlPipeline::new(&test_config(GenerationMethod::Baseline), model, executor);

    let report = pipeline.run(Uuid::new_v4(), &ctx()).await.unwrap();

    let chain = &report.repair_chain;
    assert_eq!(chain.len(), 2);
    assert!(chain.len() <= chain.max_depth());
    assert_eq!(chain.state(), RepairState::Accepted);
    assert!(chain.attempts().iter().all(|a| a.revised.is_some()));
    assert_eq!(report.executions.len(), 3);
    assert!(report.winner.candidate.sql.starts_with(REVENUE_SQL));
}

#[tokio::test]
async fn test_repair_follows_the_latest_revision() {
    let warehouse = create_warehouse();
    let executor = executor(&warehouse);
    let model = Arc::new(ScriptedModel::new(|req| match req.task {
        ReasoningTask::DirectSql => Ok("SELECT SUM(amount) FROM orders".to_string()),
        ReasoningTask::RepairSql if req.sample_index == 1 => Ok("SELECT SUM(amt_v2) FROM orders".to_string()),
        ReasoningTask::RepairSql => Ok(REVENUE_SQL.to_string()),
        other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
    }));
    let pipeline = SqlPipeline::new(&test_config(GenerationMethod::Baseline), model.clone(), executor);

    let report = pipeline.run(Uuid::new_v4(), &ctx()).await.unwrap();

    let prompts = model.prompts_for(ReasoningTask::RepairSql);
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("SUM(amount)"));
    assert!(prompts[0].contains("no such column: amount"));
    // The second repair starts from the first revision, not the original.
    assert!(prompts[1].contains("SUM(amt_v2)"));
    assert!(prompts[1].contains("no such column: amt_v2"));
    assert!(!prompts[1].contains("SUM(amount)"));

    let attempts = report.repair_chain.attempts();
    assert_eq!(attempts[1].original.id, attempts[0].revised.as_ref().unwrap().id);
    assert!(report.winner.candidate.sql.starts_with(REVENUE_SQL));
}
