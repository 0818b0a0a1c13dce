//! Agent Prompts - Prompt text for every reasoning step
//!
//! Candidate synthesis, repair, and analytics code generation all build
//! their prompts here so the wording lives in one place.

use crate::config::SqlDialect;
use crate::generation::ReasoningPath;

/// Inputs shared by every SQL-writing prompt of one request
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub question: &'a str,
    pub dataset: &'a str,
    pub dialect: SqlDialect,
    /// DDL of the linked tables, with example rows
    pub schema_ddl: &'a str,
    pub documentation: &'a str,
}

impl PromptContext<'_> {
    fn documentation_block(&self) -> String {
        if self.documentation.trim().is_empty() {
            String::new()
        } else {
            format!("\n## Documentation\n\n{}\n", self.documentation.trim())
        }
    }
}

const SQL_RULES: &str = r#"Rules:
- Write exactly one read-only SELECT statement (WITH clauses allowed).
- Use only the tables and columns shown in the schema.
- Never write INSERT, UPDATE, DELETE, MERGE, CREATE, DROP or ALTER.
- Return the query inside a ```sql code block and nothing else."#;

/// Split the question into sub-questions, one per line
pub fn build_decomposition_prompt(ctx: &PromptContext<'_>) -> String {
    format!(
        r#"Break the question into the smallest independent sub-questions that, answered with SQL and combined, answer the whole question.

## Schema ({dataset})

{schema}
{docs}
## Question

{question}

Return one sub-question per line, at most 5 lines, no numbering and no commentary.
If the question is already simple, return it unchanged on a single line."#,
        dataset = ctx.dataset,
        schema = ctx.schema_ddl,
        docs = ctx.documentation_block(),
        question = ctx.question,
    )
}

/// SQL fragment answering one sub-question
pub fn build_fragment_prompt(ctx: &PromptContext<'_>, sub_question: &str) -> String {
    format!(
        r#"Write a {dialect} query that answers this sub-question of a larger question.

## Schema ({dataset})

{schema}

## Overall question

{question}

## Sub-question

{sub_question}

{rules}"#,
        dialect = ctx.dialect.name(),
        dataset = ctx.dataset,
        schema = ctx.schema_ddl,
        question = ctx.question,
        sub_question = sub_question,
        rules = SQL_RULES,
    )
}

/// Assemble fragment queries into a final query
pub fn build_compose_prompt(
    ctx: &PromptContext<'_>,
    sub_questions: &[String],
    fragments: &[String],
) -> String {
    let steps: Vec<String> = sub_questions
        .iter()
        .zip(fragments)
        .enumerate()
        .map(|(i, (q, sql))| format!("### Step {}: {}\n\n```sql\n{}\n```", i + 1, q, sql))
        .collect();

    format!(
        r#"Combine the partial queries below into one {dialect} query that answers the overall question.
Reuse their logic (as CTEs or subqueries) rather than starting over.

## Schema ({dataset})

{schema}
{docs}
## Overall question

{question}

## Partial queries

{steps}

{rules}"#,
        dialect = ctx.dialect.name(),
        dataset = ctx.dataset,
        schema = ctx.schema_ddl,
        docs = ctx.documentation_block(),
        question = ctx.question,
        steps = steps.join("\n\n"),
        rules = SQL_RULES,
    )
}

/// Whole query in one pass, along the given reasoning path
pub fn build_direct_prompt(ctx: &PromptContext<'_>, path: ReasoningPath) -> String {
    let approach = match path {
        ReasoningPath::Direct => "Write the query directly.",
        ReasoningPath::QueryPlan => {
            "First think through the query plan the database would follow: which tables are \
             scanned, how they are joined, which rows are filtered, how rows are grouped and \
             aggregated, and how the output is ordered. Then write the query that follows that plan."
        }
    };

    format!(
        r#"You are a {dialect} expert. Answer the question with a single query over the {dataset} dataset.

## Schema ({dataset})

{schema}
{docs}
## Question

{question}

{approach}

{rules}"#,
        dialect = ctx.dialect.name(),
        dataset = ctx.dataset,
        schema = ctx.schema_ddl,
        docs = ctx.documentation_block(),
        question = ctx.question,
        approach = approach,
        rules = SQL_RULES,
    )
}

/// Revise a failing query given its execution error
pub fn build_repair_prompt(
    ctx: &PromptContext<'_>,
    failing_sql: &str,
    status: &str,
    error: &str,
) -> String {
    format!(
        r#"You are a {dialect} expert. The query below was written to answer a question but failed when executed.

## Schema ({dataset})

{schema}

## Question

{question}

## Failing query

```sql
{sql}
```

## Execution outcome

status: {status}
error: {error}

Fix the query so it runs on {dialect} and answers the question.
Keep table names, column names and literal values exactly as they appear in the schema and question.
Change only what the error requires.

{rules}"#,
        dialect = ctx.dialect.name(),
        dataset = ctx.dataset,
        schema = ctx.schema_ddl,
        question = ctx.question,
        sql = failing_sql,
        status = status,
        error = error,
        rules = SQL_RULES,
    )
}

/// Python analysis script over `data.json`
pub fn build_analytics_prompt(
    instruction: &str,
    columns: &[String],
    preview: &str,
    row_count: usize,
    previous_failure: Option<(&str, &str)>,
) -> String {
    let retry = match previous_failure {
        Some((code, error)) => format!(
            "\n## Previous attempt\n\nThis script failed:\n\n```python\n{}\n```\n\nError:\n\n{}\n\nFix the problem.\n",
            code, error
        ),
        None => String::new(),
    };

    format!(
        r#"Write a self-contained Python 3 script for this analysis request.

## Request

{instruction}

## Data

The file `data.json` in the working directory holds a JSON array of {row_count} row object(s) with keys: {columns}.
First rows:

{preview}
{retry}
Rules:
- Read only `data.json`; do not use the network or any other file.
- Print the findings to stdout as short plain text.
- If a chart helps, save it as `chart.png` with matplotlib (use the Agg backend).
- Use only the standard library, pandas and matplotlib.
- Return the script inside a ```python code block and nothing else."#,
        instruction = instruction,
        row_count = row_count,
        columns = columns.join(", "),
        preview = preview,
        retry = retry,
    )
}
