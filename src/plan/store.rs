use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::Plan;

/// Persists the plan's raw text, unchanged, to a markdown file.
#[derive(Debug, Clone)]
pub struct PlanStore {
    plan_file: PathBuf,
}

impl PlanStore {
    pub fn new(plan_file: PathBuf) -> Self {
        Self { plan_file }
    }

    pub fn path(&self) -> &Path {
        &self.plan_file
    }

    pub fn save(&self, plan: &Plan) -> Result<()> {
        if let Some(parent) = self.plan_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.plan_file, &plan.raw_text)
            .with_context(|| format!("Failed to write plan to {}", self.plan_file.display()))
    }

    /// The saved plan, re-parsed. `None` if nothing has been saved yet.
    pub fn load(&self) -> Result<Option<Plan>> {
        if !self.plan_file.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.plan_file)
            .with_context(|| format!("Failed to read plan from {}", self.plan_file.display()))?;
        Ok(Some(Plan::parse(raw)))
    }

    pub fn clear(&self) -> Result<()> {
        if self.plan_file.exists() {
            fs::remove_file(&self.plan_file).context("Failed to remove plan file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RAW: &str = "# Plan for login\n\n## Task 1: Add login\n**Description:** OAuth flow\n- [ ] wire button\n- [x] add route\n\n## Task 2: Docs\n  trailing spaces   \n";

    #[test]
    fn test_round_trip_is_lossless() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path().join(".conductor").join("plan.md"));
        let plan = Plan::parse(RAW);

        store.save(&plan).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), RAW);

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.raw_text, plan.raw_text);
        assert_eq!(loaded.tasks, plan.tasks);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path().join("plan.md"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path().join("plan.md"));
        store.save(&Plan::parse(RAW)).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }
}
