mod common;

use common::*;
use nl2sql_agent::analytics::{Artifact, SandboxFailure, SandboxFailureKind, SandboxOutput};
use nl2sql_agent::config::GenerationMethod;
use nl2sql_agent::execution::ExecutionStatus;
use nl2sql_agent::llm::{ReasoningRequest, ReasoningTask};
use nl2sql_agent::{AgentError, AnswerStatus, Result};
use std::time::Duration;

fn revenue_handler(req: &ReasoningRequest) -> Result<String> {
    match req.task {
        ReasoningTask::Decompose => {
            Ok("orders placed last month\ntotal amount of the completed ones".to_string())
        }
        ReasoningTask::Fragment => Ok(
            "```sql\nSELECT * FROM orders WHERE order_date >= '2024-05-01' AND order_date < '2024-06-01'\n```"
                .to_string(),
        ),
        ReasoningTask::Compose => Ok(format!("```sql\n{};\n```", REVENUE_SQL)),
        ReasoningTask::DirectSql if req.sample_index == 0 => Ok(
            "SELECT SUM(o.total_amount) AS total_revenue FROM orders o \
             WHERE o.order_date >= '2024-05-01' AND o.order_date < '2024-06-01' \
             AND o.status = 'completed'"
                .to_string(),
        ),
        // A plausible but wrong sample: no status or date filter.
        ReasoningTask::DirectSql => Ok("SELECT SUM(total_amount) FROM orders".to_string()),
        other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
    }
}

#[tokio::test]
async fn test_total_revenue_last_month() {
    let h = harness(
        test_config(GenerationMethod::Chase),
        ScriptedModel::new(revenue_handler),
        FakeSandbox::new(vec![]),
    );

    let answer = h
        .orchestrator
        .answer("What was the total revenue last month?", "s-1")
        .await;

    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.execution_status, Some(ExecutionStatus::Success));
    let sql = answer.sql.unwrap();
    assert!(sql.contains("SUM(total_amount)"));
    assert!(sql.contains("order_date >= '2024-05-01'"));
    assert!(sql.contains("status = 'completed'"));
    assert!(answer.text.contains("150.5"));
    assert!(answer.text.contains("**Explanation:**"));
    assert_eq!(answer.repair_attempts, 0);
    assert_eq!(h.executor.calls(), 3);
    assert_eq!(h.sandbox.calls(), 0);
}

#[tokio::test]
async fn test_unknown_table_asks_for_clarification() {
    let h = harness(
        test_config(GenerationMethod::Chase),
        ScriptedModel::new(revenue_handler),
        FakeSandbox::new(vec![]),
    );

    let answer = h
        .orchestrator
        .answer("How many spaceships launched from Mars?", "s-2")
        .await;

    assert_eq!(answer.status, AnswerStatus::NeedsClarification);
    assert!(answer.text.contains("- customers"));
    assert!(answer.text.contains("- orders"));
    assert!(answer.sql.is_none());
    assert_eq!(h.executor.calls(), 0);
    assert_eq!(h.sandbox.calls(), 0);
    assert_eq!(h.model.total_calls(), 0);
}

#[tokio::test]
async fn test_syntax_error_fixed_by_one_repair() {
    let h = harness(
        test_config(GenerationMethod::Baseline),
        ScriptedModel::new(|req| match req.task {
            ReasoningTask::DirectSql => Ok("SELEC SUM(total_amount) FROM orders".to_string()),
            ReasoningTask::RepairSql => {
                assert!(req.prompt.contains("syntax error"));
                Ok(format!("```sql\n{}\n```", REVENUE_SQL))
            }
            other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
        }),
        FakeSandbox::new(vec![]),
    );

    let answer = h
        .orchestrator
        .answer("What was the total revenue last month?", "s-3")
        .await;

    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.repair_attempts, 1);
    assert_eq!(h.model.calls_for(ReasoningTask::RepairSql), 1);
    // The broken candidate never reaches the warehouse.
    assert_eq!(h.executor.calls(), 1);
    assert!(h.executor.seen()[0].starts_with("SELECT SUM(total_amount) AS revenue"));
}

#[tokio::test]
async fn test_all_empty_results_still_answer() {
    let h = harness(
        test_config(GenerationMethod::Chase),
        ScriptedModel::new(|req| match req.task {
            ReasoningTask::Decompose => Ok("refunded orders".to_string()),
            ReasoningTask::Fragment => Ok("SELECT id FROM orders WHERE status = 'refunded'".to_string()),
            ReasoningTask::Compose => Ok("SELECT id FROM orders WHERE status = 'refunded'".to_string()),
            ReasoningTask::DirectSql => Ok(format!(
                "SELECT id, total_amount FROM orders WHERE status = 'refunded' AND id > {}",
                req.sample_index
            )),
            other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
        }),
        FakeSandbox::new(vec![]),
    );

    let answer = h.orchestrator.answer("List refunded orders", "s-4").await;

    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.execution_status, Some(ExecutionStatus::EmptyResult));
    assert!(answer.text.contains("returned no rows"));
    assert_eq!(answer.repair_attempts, 0);
    // Every empty result lands in one cluster, led by the decomposition.
    assert_eq!(answer.sql.unwrap(), "SELECT id FROM orders WHERE status = 'refunded'\nLIMIT 80");
}

#[tokio::test]
async fn test_exhausted_repairs_become_unable_to_answer() {
    let h = harness(
        test_config(GenerationMethod::Baseline),
        ScriptedModel::new(|req| match req.task {
            ReasoningTask::DirectSql => Ok("SELECT revenue FROM orders".to_string()),
            ReasoningTask::RepairSql => Ok("SELECT revenue_total FROM orders".to_string()),
            other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
        }),
        FakeSandbox::new(vec![]),
    );

    let answer = h
        .orchestrator
        .answer("What was the total revenue last month?", "s-5")
        .await;

    assert_eq!(answer.status, AnswerStatus::Unanswerable);
    assert!(!answer.text.contains("no such column"));
    assert_eq!(h.model.calls_for(ReasoningTask::RepairSql), 2);
    assert_eq!(h.executor.calls(), 3);
}

#[tokio::test]
async fn test_concurrent_identical_requests_agree() {
    let h = harness(
        test_config(GenerationMethod::Chase),
        ScriptedModel::new(revenue_handler),
        FakeSandbox::new(vec![]),
    );

    let question = "What was the total revenue last month?";
    let answers = futures::future::join_all((0..4).map(|i| {
        let session = format!("s-{}", i);
        let orchestrator = &h.orchestrator;
        async move { orchestrator.answer(question, &session).await }
    }))
    .await;

    let first = answers[0].sql.clone();
    assert!(first.is_some());
    for answer in &answers {
        assert_eq!(answer.status, AnswerStatus::Answered);
        assert_eq!(answer.sql, first);
    }
}

#[tokio::test]
async fn test_analytics_route_retries_sandbox_once() {
    let h = harness(
        test_config(GenerationMethod::Baseline),
        ScriptedModel::new(|req| match req.task {
            ReasoningTask::DirectSql => Ok(
                "SELECT status, SUM(total_amount) AS revenue FROM orders GROUP BY status".to_string(),
            ),
            ReasoningTask::AnalyticsCode => {
                Ok("```python\nimport json\nprint('completed leads')\n```".to_string())
            }
            other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
        }),
        FakeSandbox::new(vec![
            Err(SandboxFailure::new(SandboxFailureKind::Crashed, "ModuleNotFoundError: seaborn")),
            Ok(SandboxOutput {
                stdout: "completed leads with 1149.5".to_string(),
                artifacts: vec![Artifact {
                    name: "chart.png".to_string(),
                    mime_type: "image/png".to_string(),
                    bytes: vec![0x89, 0x50, 0x4e, 0x47],
                }],
            }),
        ]),
    );

    let answer = h
        .orchestrator
        .answer("Plot total revenue by order status", "s-6")
        .await;

    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(h.sandbox.calls(), 2);
    assert_eq!(h.model.calls_for(ReasoningTask::AnalyticsCode), 2);
    assert!(answer.text.contains("**Analysis:**"));
    assert!(answer.text.contains("completed leads with 1149.5"));
    assert_eq!(answer.artifact.unwrap().name, "chart.png");
}

#[tokio::test]
async fn test_analytics_failure_after_retry_is_unanswerable() {
    let crash = || Err(SandboxFailure::new(SandboxFailureKind::Crashed, "ZeroDivisionError"));
    let h = harness(
        test_config(GenerationMethod::Baseline),
        ScriptedModel::new(|req| match req.task {
            ReasoningTask::DirectSql => Ok(
                "SELECT status, SUM(total_amount) AS revenue FROM orders GROUP BY status".to_string(),
            ),
            ReasoningTask::AnalyticsCode => Ok("print(1 / 0)".to_string()),
            other => Err(AgentError::Llm(format!("unexpected task {:?}", other))),
        }),
        FakeSandbox::new(vec![crash(), crash()]),
    );

    let answer = h
        .orchestrator
        .answer("Plot total revenue by order status", "s-7")
        .await;

    assert_eq!(answer.status, AnswerStatus::Unanswerable);
    assert_eq!(h.sandbox.calls(), 2);
    assert!(!answer.text.contains("ZeroDivisionError"));
}

#[tokio::test]
async fn test_request_deadline_cancels_in_flight_work() {
    let mut config = test_config(GenerationMethod::Baseline);
    config.request_deadline_ms = 50;
    let h = harness(
        config,
        ScriptedModel::new(|_| Ok(REVENUE_SQL.to_string())).with_delay(Duration::from_millis(500)),
        FakeSandbox::new(vec![]),
    );

    let answer = h
        .orchestrator
        .answer("What was the total revenue last month?", "s-8")
        .await;

    assert_eq!(answer.status, AnswerStatus::Unanswerable);
    assert_eq!(h.executor.calls(), 0);
}
