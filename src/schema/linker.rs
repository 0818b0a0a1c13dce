//! Schema Linker
//!
//! Grounds the words of a question in warehouse tables and columns, so that
//! downstream prompts only carry the relevant slice of the schema.

use crate::config::AgentConfig;
use crate::docs::DocumentationContext;
use crate::error::{AgentError, Result};
use crate::schema::{SchemaContext, TableSchema};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use strsim::jaro_winkler;
use tracing::{debug, info};

const TABLE_WEIGHT: f64 = 3.0;
const COLUMN_WEIGHT: f64 = 1.0;
const DESCRIPTION_WEIGHT: f64 = 0.5;
const DOCUMENTATION_WEIGHT: f64 = 0.5;
const FOREIGN_KEY_DECAY: f64 = 0.25;
const MIN_TOKEN_LEN: usize = 3;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z][A-Za-z0-9]*").unwrap();
    static ref CAMEL_BOUNDARY: Regex = Regex::new(r"([a-z0-9])([A-Z])").unwrap();
    static ref STOPWORDS: HashSet<&'static str> = [
        "the", "and", "for", "from", "with", "what", "which", "who", "whom", "how", "many",
        "much", "are", "was", "were", "been", "being", "show", "list", "give", "get", "find",
        "all", "each", "per", "this", "that", "these", "those", "than", "then", "there",
        "their", "have", "has", "had", "does", "did", "can", "could", "would", "should",
        "please", "tell", "about", "into", "over", "under", "between", "our", "your", "any",
        "some", "most", "least", "more", "less", "only", "also", "not", "but", "when", "where",
        "why", "its", "it's", "let", "see", "want", "need", "use", "using", "compute",
        "calculate", "plot", "chart", "graph",
    ]
    .into_iter()
    .collect();
}

/// One table judged relevant to the question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedTable {
    pub name: String,
    pub score: f64,
    pub matched_columns: Vec<String>,
    pub reasons: Vec<String>,
    /// Included only as a join partner of a matched table
    pub via_foreign_key: bool,
}

/// Ranked, pruned view of the schema for one question
#[derive(Debug, Clone)]
pub struct LinkedSchema {
    pub tables: Vec<LinkedTable>,
    pub context: SchemaContext,
}

impl LinkedSchema {
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

pub struct SchemaLinker {
    similarity_threshold: f64,
    max_tables: usize,
}

impl SchemaLinker {
    pub fn new(similarity_threshold: f64, max_tables: usize) -> Self {
        Self {
            similarity_threshold,
            max_tables: max_tables.max(1),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.link_similarity_threshold, config.max_linked_tables)
    }

    /// Link a question to the schema, or fail with `SchemaLink` on no match.
    pub fn link(
        &self,
        question: &str,
        schema: &SchemaContext,
        docs: &DocumentationContext,
    ) -> Result<LinkedSchema> {
        let question_tokens = question_tokens(question);
        if question_tokens.is_empty() || schema.is_empty() {
            return Err(AgentError::SchemaLink(
                "No table in the warehouse matches the question".to_string(),
            ));
        }

        let paragraphs: Vec<&str> = docs.paragraphs().collect();
        let mut linked: HashMap<String, LinkedTable> = HashMap::new();

        for table in schema.tables() {
            let doc_tokens = documentation_tokens(&table.name, &paragraphs);
            if let Some(hit) = self.score_table(table, &question_tokens, &doc_tokens) {
                linked.insert(table.name.clone(), hit);
            }
        }

        if linked.is_empty() {
            return Err(AgentError::SchemaLink(
                "No table in the warehouse matches the question".to_string(),
            ));
        }

        // Pull in join partners so multi-table questions stay expressible.
        let mut partners: Vec<LinkedTable> = Vec::new();
        for hit in linked.values() {
            let Some(table) = schema.table(&hit.name) else {
                continue;
            };
            for fk in &table.foreign_keys {
                let Some(target) = schema.table(&fk.references_table) else {
                    continue;
                };
                if linked.contains_key(&target.name) || partners.iter().any(|p| p.name == target.name) {
                    continue;
                }
                partners.push(LinkedTable {
                    name: target.name.clone(),
                    score: hit.score * FOREIGN_KEY_DECAY,
                    matched_columns: vec![fk.references_column.clone()],
                    reasons: vec![format!("joined from {}.{}", table.name, fk.column)],
                    via_foreign_key: true,
                });
            }
        }

        let mut tables: Vec<LinkedTable> = linked.into_values().chain(partners).collect();
        tables.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        tables.truncate(self.max_tables);

        let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
        info!("Schema linked to {} table(s): {:?}", names.len(), names);
        let context = schema.subset(&names);

        Ok(LinkedSchema { tables, context })
    }

    fn score_table(
        &self,
        table: &TableSchema,
        question_tokens: &[String],
        doc_tokens: &HashSet<String>,
    ) -> Option<LinkedTable> {
        let table_tokens = identifier_tokens(&table.name);
        let description_tokens: HashSet<String> = table
            .description
            .as_deref()
            .map(|d| question_tokens_set(d))
            .unwrap_or_default();

        let mut score = 0.0;
        let mut matched_columns: BTreeSet<String> = BTreeSet::new();
        let mut reasons = Vec::new();

        for token in question_tokens {
            if let Some(sim) = self.best_similarity(token, &table_tokens) {
                score += TABLE_WEIGHT * sim;
                reasons.push(format!("'{}' ~ table {}", token, table.name));
            }

            for column in &table.columns {
                let mut column_tokens = identifier_tokens(&column.name);
                if let Some(description) = &column.description {
                    column_tokens.extend(question_tokens_set(description));
                }
                if let Some(sim) = self.best_similarity(token, &column_tokens) {
                    score += COLUMN_WEIGHT * sim;
                    if matched_columns.insert(column.name.clone()) {
                        reasons.push(format!("'{}' ~ column {}.{}", token, table.name, column.name));
                    }
                }
            }

            if description_tokens.contains(token) {
                score += DESCRIPTION_WEIGHT;
                reasons.push(format!("'{}' in table description", token));
            }
            if doc_tokens.contains(token) {
                score += DOCUMENTATION_WEIGHT;
                reasons.push(format!("'{}' in documentation", token));
            }
        }

        if score <= 0.0 {
            return None;
        }
        debug!(table = %table.name, score, "schema link candidate");
        Some(LinkedTable {
            name: table.name.clone(),
            score,
            matched_columns: matched_columns.into_iter().collect(),
            reasons,
            via_foreign_key: false,
        })
    }

    /// Exact match scores 1.0; otherwise the best Jaro-Winkler above threshold.
    fn best_similarity<'a, I>(&self, token: &str, candidates: I) -> Option<f64>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut best: Option<f64> = None;
        for candidate in candidates {
            if candidate == token {
                return Some(1.0);
            }
            if candidate.len() < MIN_TOKEN_LEN {
                continue;
            }
            let sim = jaro_winkler(token, candidate);
            if sim >= self.similarity_threshold && best.map_or(true, |b| sim > b) {
                best = Some(sim);
            }
        }
        best
    }
}

/// Fold simple English plurals so "orders" meets "order".
fn singularize(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Content words of free text, lowercased, stopwords removed.
fn question_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    WORD.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.len() >= MIN_TOKEN_LEN && !STOPWORDS.contains(w.as_str()))
        .map(|w| singularize(&w))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn question_tokens_set(text: &str) -> HashSet<String> {
    question_tokens(text).into_iter().collect()
}

/// Split `order_items`, `orderItems` or `sales.order_items` into word tokens.
fn identifier_tokens(identifier: &str) -> Vec<String> {
    let spaced = CAMEL_BOUNDARY.replace_all(identifier, "$1 $2");
    spaced
        .split(|c: char| c == '_' || c == '.' || c == '-' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(|p| singularize(&p.to_lowercase()))
        .collect()
}

/// Tokens of every documentation paragraph that mentions the table.
fn documentation_tokens(table_name: &str, paragraphs: &[&str]) -> HashSet<String> {
    let Ok(mention) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(table_name))) else {
        return HashSet::new();
    };
    paragraphs
        .iter()
        .filter(|p| mention.is_match(p))
        .flat_map(|p| question_tokens(p))
        .collect()
}
