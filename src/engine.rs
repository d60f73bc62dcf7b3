//! Workflow engine: definition registry and durable run state.
//!
//! One JSON record per definition (all in `definitions.json`) and one per
//! run (`runs/<run_id>.json`). Every mutation is written through a staged
//! temp file and renamed into place, so run state survives a process
//! restart with no loss beyond the currently-executing phase.

use crate::error::{Error, Result};
use crate::model::{
    now_epoch_ms, PhaseResult, WorkflowDefinition, WorkflowRun, WorkflowStatus,
};
use crate::store::write_json_atomic;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

pub struct WorkflowEngine {
    root: PathBuf,
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
}

impl WorkflowEngine {
    /// Open (or initialize) an engine under `root`, loading any persisted
    /// definitions.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let runs_dir = root.join("runs");
        std::fs::create_dir_all(&runs_dir).map_err(|e| Error::io("create", &runs_dir, e))?;
        let definitions = load_definitions(&root)?;
        Ok(Self {
            root,
            definitions: RwLock::new(definitions),
        })
    }

    fn definitions_path(&self) -> PathBuf {
        self.root.join("definitions.json")
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    /// Register a definition, replacing any previous one under the same id.
    /// Existing runs keep executing against the phases they preallocated.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        let mut defs = self.definitions.write().expect("definitions lock poisoned");
        defs.insert(definition.definition_id.clone(), definition);
        let all: Vec<WorkflowDefinition> = defs.values().cloned().collect();
        write_json_atomic(&self.definitions_path(), &all)
    }

    pub fn get_definition(&self, definition_id: &str) -> Result<WorkflowDefinition> {
        self.definitions
            .read()
            .expect("definitions lock poisoned")
            .get(definition_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("definition {definition_id}")))
    }

    pub fn list_definitions(&self) -> Vec<WorkflowDefinition> {
        self.definitions
            .read()
            .expect("definitions lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Create a run with one pending result slot per phase. Missing required
    /// input parameters fail here, before any phase executes, and nothing is
    /// persisted.
    pub fn create_run(
        &self,
        definition_id: &str,
        owner: &str,
        inputs: BTreeMap<String, String>,
    ) -> Result<WorkflowRun> {
        let definition = self.get_definition(definition_id)?;
        let missing: Vec<&str> = definition
            .required_inputs
            .iter()
            .map(String::as_str)
            .filter(|key| inputs.get(*key).map(|v| v.trim().is_empty()).unwrap_or(true))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "missing required inputs: {}",
                missing.join(", ")
            )));
        }

        let run = WorkflowRun {
            run_id: Uuid::new_v4().to_string(),
            definition_id: definition_id.to_string(),
            owner: owner.to_string(),
            status: WorkflowStatus::Pending,
            current_phase: 0,
            inputs,
            phase_results: definition
                .phases
                .iter()
                .map(|p| PhaseResult::pending(&p.phase_id))
                .collect(),
            created_at: now_epoch_ms()?,
            finished_at: None,
            error_message: None,
            correction_plan: None,
        };
        self.save_run(&run)?;
        tracing::info!(run_id = %run.run_id, definition_id, "run created");
        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        let path = self.run_path(run_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("run {run_id}")));
        }
        let bytes = std::fs::read(&path).map_err(|e| Error::io("read", &path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::json(format!("parse {}", path.display()), e))
    }

    /// All runs, newest first, optionally filtered by owner.
    pub fn list_runs(&self, owner: Option<&str>) -> Result<Vec<WorkflowRun>> {
        let runs_dir = self.root.join("runs");
        let mut runs = Vec::new();
        let entries =
            std::fs::read_dir(&runs_dir).map_err(|e| Error::io("read", &runs_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("read", &runs_dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| Error::io("read", &path, e))?;
            let run: WorkflowRun = serde_json::from_slice(&bytes)
                .map_err(|e| Error::json(format!("parse {}", path.display()), e))?;
            if owner.map(|o| run.owner == o).unwrap_or(true) {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    pub fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        write_json_atomic(&self.run_path(&run.run_id), run)
    }

    /// Delete a run's record. Unknown ids are a NotFound error.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        let path = self.run_path(run_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("run {run_id}")));
        }
        std::fs::remove_file(&path).map_err(|e| Error::io("remove", &path, e))
    }
}

fn load_definitions(root: &Path) -> Result<BTreeMap<String, WorkflowDefinition>> {
    let path = root.join("definitions.json");
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    let bytes = std::fs::read(&path).map_err(|e| Error::io("read", &path, e))?;
    let all: Vec<WorkflowDefinition> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::json(format!("parse {}", path.display()), e))?;
    Ok(all
        .into_iter()
        .map(|d| (d.definition_id.clone(), d))
        .collect())
}
