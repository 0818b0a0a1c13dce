//! Warehouse Schema
//!
//! `SchemaContext` is the read-only description of the warehouse handed to
//! every component of a request. `SchemaCatalog` caches one versioned
//! snapshot per process and replaces it copy-on-write on invalidation.

pub mod linker;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            description: None,
            primary_key: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub description: Option<String>,
    /// A few example rows, in column order
    #[serde(default)]
    pub sample_rows: Vec<Vec<serde_json::Value>>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            foreign_keys: Vec::new(),
            description: None,
            sample_rows: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// `CREATE TABLE` statement followed by example rows as `INSERT`s.
    pub fn render_ddl(&self) -> String {
        let mut ddl = String::new();
        if let Some(description) = &self.description {
            ddl.push_str(&format!("-- {}\n", description));
        }
        ddl.push_str(&format!("CREATE TABLE {} (\n", self.name));

        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("  {} {}", c.name, c.data_type);
                if c.primary_key {
                    line.push_str(" PRIMARY KEY");
                }
                if let Some(description) = &c.description {
                    line.push_str(&format!(" -- {}", description));
                }
                line
            })
            .collect();
        for fk in &self.foreign_keys {
            lines.push(format!(
                "  FOREIGN KEY ({}) REFERENCES {}({})",
                fk.column, fk.references_table, fk.references_column
            ));
        }
        ddl.push_str(&lines.join(",\n"));
        ddl.push_str("\n);\n");

        if !self.sample_rows.is_empty() {
            ddl.push_str(&format!("-- Example values for table {}:\n", self.name));
            for row in &self.sample_rows {
                let values: Vec<String> = row.iter().map(sql_literal).collect();
                ddl.push_str(&format!("INSERT INTO {} VALUES ({});\n", self.name, values.join(", ")));
            }
        }
        ddl
    }
}

fn sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

/// Mapping from table name to its description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaContext {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaContext {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name).or_else(|| {
            self.tables
                .values()
                .find(|t| t.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// New context holding only the named tables (unknown names are skipped).
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> SchemaContext {
        let tables = names
            .iter()
            .filter_map(|n| self.table(n.as_ref()))
            .cloned()
            .collect();
        SchemaContext::new(tables)
    }

    pub fn render_ddl(&self) -> String {
        self.tables
            .values()
            .map(TableSchema::render_ddl)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Source of warehouse metadata
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn describe_schema(&self) -> Result<SchemaContext>;
}

#[async_trait]
impl SchemaSource for SchemaContext {
    async fn describe_schema(&self) -> Result<SchemaContext> {
        Ok(self.clone())
    }
}

/// Immutable, versioned view of the warehouse schema
#[derive(Debug)]
pub struct SchemaSnapshot {
    pub version: u64,
    pub context: SchemaContext,
    pub loaded_at: DateTime<Utc>,
}

struct CatalogState {
    current: Option<Arc<SchemaSnapshot>>,
    next_version: u64,
}

/// Process-wide schema cache, rebuilt only after `invalidate`
pub struct SchemaCatalog {
    source: Arc<dyn SchemaSource>,
    state: RwLock<CatalogState>,
}

impl SchemaCatalog {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            state: RwLock::new(CatalogState {
                current: None,
                next_version: 1,
            }),
        }
    }

    /// Active snapshot, describing the warehouse on first use.
    pub async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>> {
        if let Some(current) = &self.state.read().await.current {
            return Ok(Arc::clone(current));
        }

        let mut state = self.state.write().await;
        // Another request may have rebuilt while we waited for the lock.
        if let Some(current) = &state.current {
            return Ok(Arc::clone(current));
        }

        let context = self.source.describe_schema().await?;
        let snapshot = Arc::new(SchemaSnapshot {
            version: state.next_version,
            context,
            loaded_at: Utc::now(),
        });
        state.next_version += 1;
        state.current = Some(Arc::clone(&snapshot));
        info!(
            "Schema snapshot v{} loaded with {} table(s)",
            snapshot.version,
            snapshot.context.len()
        );
        Ok(snapshot)
    }

    /// Drop the active snapshot. Requests already holding it keep their copy.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        if let Some(old) = state.current.take() {
            info!("Schema snapshot v{} invalidated", old.version);
        }
    }
}
