//! Exercise catalog files
//!
//! A catalog lists exercise records and their rule thresholds:
//!
//! ```toml
//! [[exercises]]
//! id = 1
//! name = "Back Squat"
//! primary_muscle = "quads"
//!
//! [exercises.rules.depth_low]
//! max_knee_angle = 95
//! ```
//!
//! The same shape is accepted as JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::models::Exercise;
use crate::store::SessionStore;

/// Listing limit when the caller does not give one
pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub exercises: Vec<Exercise>,
}

impl CatalogFile {
    /// Parse a catalog, picking the format from the file extension
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        let catalog: CatalogFile = match extension.as_deref() {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML catalog: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON catalog: {}", path.display()))?,
            _ => anyhow::bail!(
                "Unsupported catalog format (expected .toml or .json): {}",
                path.display()
            ),
        };

        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for exercise in &self.exercises {
            if exercise.name.trim().is_empty() {
                anyhow::bail!("exercise {} has an empty name", exercise.id);
            }
            if !seen.insert(exercise.id) {
                anyhow::bail!("exercise id {} appears more than once", exercise.id);
            }
        }
        Ok(())
    }
}

/// Upsert every exercise in the catalog file, returning how many were written.
///
/// Callers holding a [`SetAggregator`](crate::aggregator::SetAggregator)
/// should clear its rule cache afterwards.
pub fn import_catalog<P: AsRef<Path>>(store: &dyn SessionStore, path: P) -> Result<usize> {
    let path = path.as_ref();
    let catalog = CatalogFile::load_from_file(path)?;

    for exercise in &catalog.exercises {
        store
            .upsert_exercise(exercise)
            .with_context(|| format!("Failed to store exercise {}", exercise.id))?;
    }

    info!(
        file = %path.display(),
        count = catalog.exercises.len(),
        "Catalog imported"
    );
    Ok(catalog.exercises.len())
}

/// Catalog listing filtered by a case-insensitive `primary_muscle` substring
pub fn list_exercises(
    store: &dyn SessionStore,
    muscle: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<Exercise>> {
    let muscle = muscle.map(str::trim).filter(|m| !m.is_empty());
    let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(store.list_exercises(muscle, limit)?)
}
