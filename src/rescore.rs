//! Offline re-scoring of recorded rep metrics
//!
//! Reads a CSV whose header names the metrics (plus an optional `rep_index`
//! column), scores every row against an exercise's current rules and folds
//! the results the same way a live set would. No set state is touched.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::error::NotFoundError;
use crate::models::{ExerciseId, RepMetrics, RepScore, RuleConfig, Suggestion, ViolationHistogram};
use crate::scoring;
use crate::store::SessionStore;
use crate::suggestion;

const REP_INDEX_COLUMN: &str = "rep_index";

/// One CSV row ready for scoring
#[derive(Debug, Clone, PartialEq)]
pub struct RepRow {
    pub rep_index: i64,
    pub metrics: RepMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RescoredRep {
    pub rep_index: i64,
    pub score: RepScore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RescoreReport {
    pub reps: Vec<RescoredRep>,
    pub mean_score: Option<f64>,
    pub histogram: ViolationHistogram,
    pub suggestion: Suggestion,
}

/// Parse rep rows from CSV. Blank cells are treated as absent metrics.
pub fn read_reps<R: Read>(reader: R) -> Result<Vec<RepRow>> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.to_lowercase().replace([' ', '-'], "_"))
        .collect();

    let mut rows = Vec::new();
    for (position, record) in csv_reader.records().enumerate() {
        let line = position + 2;
        let record = record.with_context(|| format!("Malformed CSV record on line {}", line))?;

        let mut rep_index = position as i64 + 1;
        let mut metrics = Vec::new();
        for (column, cell) in headers.iter().zip(record.iter()) {
            if cell.is_empty() {
                continue;
            }
            if column == REP_INDEX_COLUMN {
                rep_index = cell.parse().with_context(|| {
                    format!("Invalid rep_index '{}' on line {}", cell, line)
                })?;
                continue;
            }

            let value: f64 = cell.parse().with_context(|| {
                format!("Invalid value '{}' for {} on line {}", cell, column, line)
            })?;
            if !value.is_finite() {
                anyhow::bail!("Non-finite value for {} on line {}", column, line);
            }
            metrics.push((column.clone(), value));
        }

        rows.push(RepRow {
            rep_index,
            metrics: metrics.into_iter().collect(),
        });
    }

    Ok(rows)
}

/// Score rows in parallel and fold them in row order
pub fn rescore(rows: &[RepRow], rules: Option<&RuleConfig>) -> RescoreReport {
    let reps: Vec<RescoredRep> = rows
        .par_iter()
        .map(|row| RescoredRep {
            rep_index: row.rep_index,
            score: scoring::evaluate(&row.metrics, rules),
        })
        .collect();

    let mut histogram = ViolationHistogram::new();
    let mut score_sum = 0.0;
    for rep in &reps {
        score_sum += rep.score.score;
        for kind in &rep.score.violations {
            *histogram.entry(kind.clone()).or_insert(0) += 1;
        }
    }

    let mean_score = if reps.is_empty() {
        None
    } else {
        Some(score_sum / reps.len() as f64)
    };
    let suggestion = suggestion::select(&histogram);

    debug!(reps = reps.len(), ?mean_score, "Rows rescored");
    RescoreReport {
        reps,
        mean_score,
        histogram,
        suggestion,
    }
}

/// Rescore a CSV file against the catalog rules of `exercise_id`
pub fn rescore_file<P: AsRef<Path>>(
    store: &dyn SessionStore,
    path: P,
    exercise_id: ExerciseId,
) -> Result<RescoreReport> {
    let path = path.as_ref();
    let exercise = store
        .load_exercise(exercise_id)?
        .ok_or(NotFoundError::Exercise { exercise_id })?;

    let file =
        File::open(path).with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    let rows = read_reps(file)?;
    let report = rescore(&rows, exercise.rules.as_ref());

    info!(
        file = %path.display(),
        exercise_id,
        reps = report.reps.len(),
        mean_score = ?report.mean_score,
        "Rescore complete"
    );
    Ok(report)
}
