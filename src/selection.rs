//! Candidate Selector
//!
//! Self-consistency voting over executed candidates. Candidates whose
//! results are equal under normalized comparison form a cluster; the largest
//! cluster wins. Ties fall back to strategy confidence, then query
//! simplicity, then generation order. The decision depends only on
//! candidate ordinals and outcomes, so input order never matters.

use crate::config::SqlDialect;
use crate::execution::{ExecutionOutcome, ExecutionStatus, ResultSet};
use crate::generation::{CandidateId, CandidateQuery};
use crate::sql_guard::SqlGuard;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Result of one selection round
#[derive(Debug, Clone)]
pub enum Selection {
    Winner {
        candidate: CandidateQuery,
        outcome: ExecutionOutcome,
        /// Candidates that agreed with the winner, in ordinal order
        cluster: Vec<CandidateId>,
    },
    /// Nothing executed cleanly; the most promising failure is handed to
    /// the corrector.
    NoViableCandidate {
        repair_target: Option<(CandidateQuery, ExecutionOutcome)>,
    },
}

/// Canonical form of a result set: rows as sorted cell lists, rows sorted
type Signature = Vec<Vec<String>>;

/// Sort key of a candidate inside and across clusters; smaller is better
type MemberKey = (Reverse<u8>, usize, String, CandidateId);

pub struct CandidateSelector {
    numeric_tolerance: f64,
    guard: SqlGuard,
}

impl CandidateSelector {
    pub fn new(numeric_tolerance: f64, dialect: SqlDialect) -> Self {
        Self {
            numeric_tolerance,
            guard: SqlGuard::new(dialect),
        }
    }

    pub fn select(&self, pool: &[(CandidateQuery, ExecutionOutcome)]) -> Selection {
        let mut clusters: BTreeMap<Signature, Vec<usize>> = BTreeMap::new();
        for (index, (_, outcome)) in pool.iter().enumerate() {
            if !outcome.is_viable() {
                continue;
            }
            let signature = match &outcome.result {
                Some(result) => self.signature(result),
                None => Signature::new(),
            };
            clusters.entry(signature).or_default().push(index);
        }

        if clusters.is_empty() {
            let repair_target = pool
                .iter()
                .min_by_key(|(candidate, outcome)| {
                    (
                        failure_rank(outcome.status),
                        Reverse(candidate.strategy.confidence()),
                        candidate.id,
                    )
                })
                .cloned();
            info!(
                "No viable candidate among {}; repair target {:?}",
                pool.len(),
                repair_target.as_ref().map(|(c, o)| (c.id, o.status))
            );
            return Selection::NoViableCandidate { repair_target };
        }

        let ranked = clusters
            .into_iter()
            .map(|(signature, members)| {
                let best = members
                    .iter()
                    .copied()
                    .min_by_key(|&i| self.member_key(&pool[i].0))
                    .unwrap_or(members[0]);
                let key = (
                    Reverse(members.len()),
                    signature.is_empty(),
                    self.member_key(&pool[best].0),
                );
                (key, best, members)
            })
            .min_by(|a, b| a.0.cmp(&b.0));

        let Some((_, best, members)) = ranked else {
            return Selection::NoViableCandidate { repair_target: None };
        };

        let mut cluster: Vec<CandidateId> = members.iter().map(|&i| pool[i].0.id).collect();
        cluster.sort();

        let (candidate, outcome) = pool[best].clone();
        info!(
            "Selected candidate {} ({:?}, {}) backed by {} of {} candidate(s)",
            candidate.id,
            candidate.strategy,
            outcome.status,
            cluster.len(),
            pool.len()
        );
        Selection::Winner {
            candidate,
            outcome,
            cluster,
        }
    }

    fn member_key(&self, candidate: &CandidateQuery) -> MemberKey {
        (
            Reverse(candidate.strategy.confidence()),
            self.guard.join_count(&candidate.sql),
            candidate.sql.clone(),
            candidate.id,
        )
    }

    fn signature(&self, result: &ResultSet) -> Signature {
        let mut rows: Signature = result
            .rows
            .iter()
            .map(|row| {
                let mut cells: Vec<String> = row.iter().map(|v| self.canonical_cell(v)).collect();
                cells.sort();
                cells
            })
            .collect();
        rows.sort();
        debug!("Result signature over {} row(s)", rows.len());
        rows
    }

    fn canonical_cell(&self, value: &Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("b:{}", b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => self.canonical_number(f),
                None => format!("n:{}", n),
            },
            Value::String(s) => {
                let trimmed = s.trim();
                match trimmed.parse::<f64>() {
                    Ok(f) if f.is_finite() => self.canonical_number(f),
                    _ => format!("s:{}", trimmed),
                }
            }
            other => format!("j:{}", other),
        }
    }

    fn canonical_number(&self, value: f64) -> String {
        let quantized = if self.numeric_tolerance > 0.0 {
            (value / self.numeric_tolerance).round()
        } else {
            value
        };
        // Fold -0 into 0.
        let quantized = if quantized == 0.0 { 0.0 } else { quantized };
        format!("n:{}", quantized)
    }
}

fn failure_rank(status: ExecutionStatus) -> u8 {
    match status {
        ExecutionStatus::RuntimeError => 0,
        ExecutionStatus::SyntaxError => 1,
        ExecutionStatus::Timeout => 2,
        ExecutionStatus::Success | ExecutionStatus::EmptyResult => 3,
    }
}
