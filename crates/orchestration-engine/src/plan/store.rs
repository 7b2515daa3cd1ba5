//! Plan storage with file persistence.
//!
//! Plans are kept in memory for fast access, with optional JSON file
//! persistence so registered plans survive restarts. Each file carries the
//! schema version it was written with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::Plan;
use crate::error::Result;

/// Version stamped into every persisted plan file.
pub const SCHEMA_VERSION: u32 = 1;

/// Metadata for a stored plan (for listing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub id: String,
    pub name: String,
    pub node_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPlan {
    schema_version: u32,
    plan: Plan,
}

/// In-memory plan store with optional file persistence.
///
/// # Example
///
/// ```ignore
/// let mut store = PlanStore::with_persistence(".orchestration/plans");
/// let count = store.load_from_disk()?;
/// store.insert(plan)?;
/// ```
#[derive(Debug, Default)]
pub struct PlanStore {
    plans: HashMap<String, Plan>,
    persist_path: Option<PathBuf>,
}

impl PlanStore {
    /// Create a new in-memory store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that persists to the given directory.
    ///
    /// The directory is created on first save.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            plans: HashMap::new(),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load all plans from the persistence directory.
    ///
    /// Files that fail to parse or carry a newer schema are skipped with a
    /// warning. Returns the number of plans loaded.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };

        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let file_path = entry?.path();
            if file_path.extension().map_or(true, |e| e != "json") {
                continue;
            }

            let content = std::fs::read_to_string(&file_path)?;
            match serde_json::from_str::<StoredPlan>(&content) {
                Ok(stored) if stored.schema_version > SCHEMA_VERSION => {
                    log::warn!(
                        "Skipping plan file {:?}: schema version {} is newer than {}",
                        file_path,
                        stored.schema_version,
                        SCHEMA_VERSION
                    );
                }
                Ok(stored) => {
                    log::info!("Loaded plan '{}' from {:?}", stored.plan.id, file_path);
                    self.plans.insert(stored.plan.id.clone(), stored.plan);
                    count += 1;
                }
                Err(e) => {
                    log::warn!("Failed to parse plan from {:?}: {}", file_path, e);
                }
            }
        }
        Ok(count)
    }

    fn save_to_disk(&self, plan: &Plan) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}.json", plan.id));
        let stored = StoredPlan {
            schema_version: SCHEMA_VERSION,
            plan: plan.clone(),
        };
        std::fs::write(&file_path, serde_json::to_string_pretty(&stored)?)?;
        log::debug!("Saved plan '{}' to {:?}", plan.id, file_path);
        Ok(())
    }

    fn delete_from_disk(&self, id: &str) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        let file_path = path.join(format!("{}.json", id));
        if file_path.exists() {
            std::fs::remove_file(&file_path)?;
            log::debug!("Deleted plan '{}' from {:?}", id, file_path);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Plan> {
        self.plans.get(id)
    }

    /// Insert or replace a plan, persisting it if enabled.
    pub fn insert(&mut self, plan: Plan) -> Result<()> {
        self.save_to_disk(&plan)?;
        self.plans.insert(plan.id.clone(), plan);
        Ok(())
    }

    /// Remove a plan by ID, returning it if it existed.
    pub fn remove(&mut self, id: &str) -> Result<Option<Plan>> {
        self.delete_from_disk(id)?;
        Ok(self.plans.remove(id))
    }

    pub fn list(&self) -> Vec<PlanMetadata> {
        self.plans
            .values()
            .map(|p| PlanMetadata {
                id: p.id.clone(),
                name: p.name.clone(),
                node_count: p.nodes.len(),
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plans.contains_key(id)
    }
}
