//! SQL Guard
//!
//! Cleans generated SQL text and enforces the read-only contract before
//! anything reaches the warehouse. Parsing uses `sqlparser` in the
//! configured dialect.

use crate::config::SqlDialect;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{BigQueryDialect, Dialect, GenericDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;

lazy_static! {
    static ref FENCED_CODE: Regex =
        Regex::new(r"(?is)```[ \t]*(?:sqlite|postgresql|googlesql|bigquery|sql)?[ \t]*\r?\n?(.*?)```").unwrap();
    static ref QUERY_START: Regex = Regex::new(r"(?im)^\s*(select|with)\b").unwrap();
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)\blimit\b").unwrap();
    static ref JOIN_KEYWORD: Regex = Regex::new(r"(?i)\bjoin\b").unwrap();
}

/// Why a candidate was refused before execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardRejection {
    Empty,
    Unparseable(String),
    MultipleStatements(usize),
    NotReadOnly(String),
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRejection::Empty => write!(f, "empty SQL text"),
            GuardRejection::Unparseable(msg) => write!(f, "syntax error: {}", msg),
            GuardRejection::MultipleStatements(n) => {
                write!(f, "expected a single statement, found {}", n)
            }
            GuardRejection::NotReadOnly(kind) => write!(
                f,
                "only read-only SELECT queries are permitted, found {}",
                kind
            ),
        }
    }
}

/// Structural facts about an accepted query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryShape {
    pub join_count: usize,
    pub tables: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SqlGuard {
    dialect: SqlDialect,
}

impl SqlGuard {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self.dialect {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
            SqlDialect::BigQuery => Box::new(BigQueryDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
        }
    }

    /// Accept exactly one read-only query, or say why not.
    pub fn check(&self, sql: &str) -> Result<QueryShape, GuardRejection> {
        if sql.trim().is_empty() {
            return Err(GuardRejection::Empty);
        }
        let dialect = self.parser_dialect();
        let statements = Parser::parse_sql(dialect.as_ref(), sql)
            .map_err(|e| GuardRejection::Unparseable(e.to_string()))?;

        match statements.as_slice() {
            [] => Err(GuardRejection::Empty),
            [Statement::Query(query)] => {
                let mut shape = QueryShape::default();
                walk_query(query, &mut shape)?;
                Ok(shape)
            }
            [other] => Err(GuardRejection::NotReadOnly(statement_kind(other))),
            many => Err(GuardRejection::MultipleStatements(many.len())),
        }
    }

    /// Join count for tie-breaking; falls back to keyword counting when the
    /// text does not parse.
    pub fn join_count(&self, sql: &str) -> usize {
        match self.check(sql) {
            Ok(shape) => shape.join_count,
            Err(_) => JOIN_KEYWORD.find_iter(sql).count(),
        }
    }
}

fn statement_kind(statement: &Statement) -> String {
    let text = statement.to_string();
    text.split_whitespace()
        .next()
        .unwrap_or("statement")
        .to_uppercase()
}

fn walk_query(query: &Query, shape: &mut QueryShape) -> Result<(), GuardRejection> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            walk_query(&cte.query, shape)?;
        }
    }
    walk_set_expr(&query.body, shape)
}

fn walk_set_expr(expr: &SetExpr, shape: &mut QueryShape) -> Result<(), GuardRejection> {
    match expr {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(GuardRejection::NotReadOnly("SELECT INTO".to_string()));
            }
            // Comma-separated FROM items are implicit joins.
            shape.join_count += select.from.len().saturating_sub(1);
            for item in &select.from {
                walk_table_with_joins(item, shape)?;
            }
            Ok(())
        }
        SetExpr::Query(query) => walk_query(query, shape),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, shape)?;
            walk_set_expr(right, shape)
        }
        other => {
            // Data-modifying bodies (e.g. INSERT inside a CTE) render with
            // their leading keyword.
            let text = other.to_string();
            let head = text.split_whitespace().next().unwrap_or_default().to_uppercase();
            if matches!(head.as_str(), "INSERT" | "UPDATE" | "DELETE" | "MERGE") {
                Err(GuardRejection::NotReadOnly(head))
            } else {
                Ok(())
            }
        }
    }
}

fn walk_table_with_joins(item: &TableWithJoins, shape: &mut QueryShape) -> Result<(), GuardRejection> {
    walk_table_factor(&item.relation, shape)?;
    shape.join_count += item.joins.len();
    for join in &item.joins {
        walk_table_factor(&join.relation, shape)?;
    }
    Ok(())
}

fn walk_table_factor(factor: &TableFactor, shape: &mut QueryShape) -> Result<(), GuardRejection> {
    match factor {
        TableFactor::Table { name, .. } => {
            if let Some(ident) = name.0.last() {
                shape.tables.insert(ident.value.to_lowercase());
            }
            Ok(())
        }
        TableFactor::Derived { subquery, .. } => walk_query(subquery, shape),
        TableFactor::NestedJoin { table_with_joins, .. } => walk_table_with_joins(table_with_joins, shape),
        _ => Ok(()),
    }
}

/// Pull the SQL body out of raw model output: strip code fences and leading
/// prose, undo escaping, drop trailing semicolons.
pub fn extract_sql(raw: &str) -> String {
    let body = match FENCED_CODE.captures(raw) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string(),
        None => match QUERY_START.find(raw) {
            Some(m) => raw[m.start()..].to_string(),
            None => raw.to_string(),
        },
    };

    let mut sql = body
        .replace("\\\"", "\"")
        .replace("\\\n", "\n")
        .replace("\\'", "'")
        .replace("\\n", "\n")
        .trim()
        .to_string();

    while sql.ends_with(';') {
        sql.pop();
        sql = sql.trim_end().to_string();
    }
    sql
}

/// [`extract_sql`], then cap the row count with `LIMIT` when the query has
/// none.
pub fn clean_generated_sql(raw: &str, max_rows: usize) -> String {
    let sql = extract_sql(raw);
    if sql.is_empty() || LIMIT_CLAUSE.is_match(&sql) {
        return sql;
    }
    format!("{}\nLIMIT {}", sql, max_rows)
}
