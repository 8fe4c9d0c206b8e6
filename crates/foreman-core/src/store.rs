// Protocol Store
// Persistence layer for protocol records, step runs, spec versions,
// event journals, and captured artifacts.

use crate::error::{ForemanError, Result};
use foreman_types::{
    ArtifactKind, ArtifactRecord, Clarification, EventRecord, ProtocolRun, ProtocolSpec, StepRun,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// On-disk layout, rooted at `<root>/.foreman/orchestrator`:
///
/// ```text
/// counters.json
/// clarifications.json
/// <protocol_id>/
///   protocol.json
///   steps.json
///   specs/<spec_hash>.json
///   events.jsonl
///   steps/<step_run_id>/artifacts/{stdout, aux/*, git-status.txt, diff}
/// ```
pub struct ProtocolStore {
    base_dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectCounters {
    #[serde(default)]
    next_number: HashMap<String, u32>,
}

impl ProtocolStore {
    pub fn new(state_root: &Path) -> Result<Self> {
        let base_dir = state_root.join(".foreman").join("orchestrator");
        fs::create_dir_all(&base_dir)
            .map_err(|e| ForemanError::System(format!("failed to create store directory: {}", e)))?;
        Ok(Self { base_dir })
    }

    fn protocol_dir(&self, protocol_id: &str) -> PathBuf {
        self.base_dir.join(protocol_id)
    }

    /// Allocate the next `NNNN` number for a project. Persisted so numbering
    /// stays monotone across restarts.
    pub fn allocate_number(&self, project_id: &str) -> Result<u32> {
        let path = self.base_dir.join("counters.json");
        let mut counters: ProjectCounters = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| ForemanError::Parse(format!("failed to parse counters: {}", e)))?,
            Err(_) => ProjectCounters::default(),
        };

        let entry = counters.next_number.entry(project_id.to_string()).or_insert(1);
        let number = *entry;
        *entry += 1;

        let content = serde_json::to_string_pretty(&counters)?;
        atomic_write(&path, &content)?;
        Ok(number)
    }

    pub fn save_protocol(&self, run: &ProtocolRun) -> Result<()> {
        let dir = self.protocol_dir(&run.id);
        fs::create_dir_all(&dir)
            .map_err(|e| ForemanError::System(format!("failed to create protocol dir: {}", e)))?;
        let content = serde_json::to_string_pretty(run)?;
        atomic_write(&dir.join("protocol.json"), &content)
    }

    pub fn load_protocol(&self, protocol_id: &str) -> Result<ProtocolRun> {
        let path = self.protocol_dir(protocol_id).join("protocol.json");
        let content = fs::read_to_string(&path)
            .map_err(|_| ForemanError::NotFound(format!("protocol {}", protocol_id)))?;
        serde_json::from_str(&content)
            .map_err(|e| ForemanError::Parse(format!("failed to parse protocol record: {}", e)))
    }

    pub fn protocol_exists(&self, protocol_id: &str) -> bool {
        self.protocol_dir(protocol_id).join("protocol.json").exists()
    }

    pub fn save_steps(&self, protocol_id: &str, steps: &[StepRun]) -> Result<()> {
        let dir = self.protocol_dir(protocol_id);
        fs::create_dir_all(&dir)
            .map_err(|e| ForemanError::System(format!("failed to create protocol dir: {}", e)))?;
        let content = serde_json::to_string_pretty(steps)?;
        atomic_write(&dir.join("steps.json"), &content)
    }

    pub fn load_steps(&self, protocol_id: &str) -> Result<Vec<StepRun>> {
        let path = self.protocol_dir(protocol_id).join("steps.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| ForemanError::System(format!("failed to read steps file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ForemanError::Parse(format!("failed to parse steps file: {}", e)))
    }

    /// Persist a spec version. Spec documents are immutable once written:
    /// an existing file for the same hash is left untouched.
    pub fn save_spec(&self, protocol_id: &str, spec_hash: &str, spec: &ProtocolSpec) -> Result<()> {
        let dir = self.protocol_dir(protocol_id).join("specs");
        fs::create_dir_all(&dir)
            .map_err(|e| ForemanError::System(format!("failed to create specs dir: {}", e)))?;
        let path = dir.join(format!("{}.json", spec_hash));
        if path.exists() {
            return Ok(());
        }
        let content = serde_json::to_string_pretty(spec)?;
        atomic_write(&path, &content)
    }

    pub fn load_spec(&self, protocol_id: &str, spec_hash: &str) -> Result<ProtocolSpec> {
        let path = self
            .protocol_dir(protocol_id)
            .join("specs")
            .join(format!("{}.json", spec_hash));
        let content = fs::read_to_string(&path).map_err(|_| {
            ForemanError::NotFound(format!("spec {} for protocol {}", spec_hash, protocol_id))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ForemanError::Parse(format!("failed to parse spec version: {}", e)))
    }

    pub fn append_event(&self, record: &EventRecord) -> Result<()> {
        let dir = self.protocol_dir(&record.protocol_id);
        fs::create_dir_all(&dir)
            .map_err(|e| ForemanError::System(format!("failed to create protocol dir: {}", e)))?;
        let path = dir.join("events.jsonl");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ForemanError::System(format!("failed to open events jsonl: {}", e)))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)
            .map_err(|e| ForemanError::System(format!("failed to write event: {}", e)))?;
        Ok(())
    }

    pub fn latest_event_seq(&self, protocol_id: &str) -> Result<u64> {
        let path = self.protocol_dir(protocol_id).join("events.jsonl");
        if !path.exists() {
            return Ok(0);
        }
        let file = File::open(&path)
            .map_err(|e| ForemanError::System(format!("failed to open events jsonl: {}", e)))?;
        let reader = BufReader::new(file);
        let mut latest = 0u64;
        for line in reader.lines() {
            let line = line
                .map_err(|e| ForemanError::System(format!("failed reading events jsonl: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<EventRecord>(&line) {
                latest = latest.max(record.seq);
            }
        }
        Ok(latest)
    }

    pub fn load_events(
        &self,
        protocol_id: &str,
        since_seq: Option<u64>,
        tail: Option<usize>,
    ) -> Result<Vec<EventRecord>> {
        let path = self.protocol_dir(protocol_id).join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)
            .map_err(|e| ForemanError::System(format!("failed to open events jsonl: {}", e)))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| ForemanError::System(format!("failed reading events jsonl: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<EventRecord>(&line) {
                if let Some(min_seq) = since_seq {
                    if record.seq <= min_seq {
                        continue;
                    }
                }
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.seq);
        if let Some(tail_count) = tail {
            if records.len() > tail_count {
                records = records.split_off(records.len() - tail_count);
            }
        }
        Ok(records)
    }

    /// Archive step runs replaced by a re-plan so their records stay
    /// retrievable by id alongside their artifacts.
    pub fn append_step_history(&self, protocol_id: &str, steps: &[StepRun]) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let dir = self.protocol_dir(protocol_id);
        fs::create_dir_all(&dir)
            .map_err(|e| ForemanError::System(format!("failed to create protocol dir: {}", e)))?;
        let path = dir.join("steps_history.jsonl");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ForemanError::System(format!("failed to open step history: {}", e)))?;
        for step in steps {
            let line = serde_json::to_string(step)?;
            writeln!(file, "{}", line)
                .map_err(|e| ForemanError::System(format!("failed to write step history: {}", e)))?;
        }
        Ok(())
    }

    pub fn load_step_history(&self, protocol_id: &str) -> Result<Vec<StepRun>> {
        let path = self.protocol_dir(protocol_id).join("steps_history.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)
            .map_err(|e| ForemanError::System(format!("failed to open step history: {}", e)))?;
        let reader = BufReader::new(file);
        let mut steps = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| ForemanError::System(format!("failed reading step history: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(step) = serde_json::from_str::<StepRun>(&line) {
                steps.push(step);
            }
        }
        Ok(steps)
    }

    pub fn artifacts_dir(&self, protocol_id: &str, step_run_id: &str) -> PathBuf {
        self.protocol_dir(protocol_id)
            .join("steps")
            .join(step_run_id)
            .join("artifacts")
    }

    /// Write one captured artifact and return its record (sha256 + size).
    pub fn write_artifact(
        &self,
        protocol_id: &str,
        step_run_id: &str,
        name: &str,
        kind: ArtifactKind,
        bytes: &[u8],
        partial: bool,
    ) -> Result<ArtifactRecord> {
        let dir = self.artifacts_dir(protocol_id, step_run_id);
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ForemanError::System(format!("failed to create artifact directory: {}", e))
            })?;
        }
        fs::write(&path, bytes)
            .map_err(|e| ForemanError::System(format!("failed to write artifact: {}", e)))?;

        Ok(ArtifactRecord {
            name: name.to_string(),
            path,
            sha256: sha256_hex(bytes),
            size_bytes: bytes.len() as u64,
            kind,
            partial,
        })
    }

    pub fn read_artifact(
        &self,
        protocol_id: &str,
        step_run_id: &str,
        name: &str,
    ) -> Result<Vec<u8>> {
        let path = self.artifacts_dir(protocol_id, step_run_id).join(name);
        fs::read(&path).map_err(|_| {
            ForemanError::NotFound(format!("artifact {} for step {}", name, step_run_id))
        })
    }

    pub fn save_clarifications(&self, clarifications: &[Clarification]) -> Result<()> {
        let content = serde_json::to_string_pretty(clarifications)?;
        atomic_write(&self.base_dir.join("clarifications.json"), &content)
    }

    pub fn load_clarifications(&self) -> Result<Vec<Clarification>> {
        let path = self.base_dir.join("clarifications.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| ForemanError::System(format!("failed to read clarifications: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| ForemanError::Parse(format!("failed to parse clarifications: {}", e)))
    }

    pub fn list_protocols(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut protocols = Vec::new();
        for entry in fs::read_dir(&self.base_dir)
            .map_err(|e| ForemanError::System(format!("failed to read store directory: {}", e)))?
        {
            let entry = entry
                .map_err(|e| ForemanError::System(format!("failed to read store entry: {}", e)))?;
            if entry.path().is_dir() && entry.path().join("protocol.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    protocols.push(name.to_string());
                }
            }
        }
        protocols.sort();
        Ok(protocols)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Atomic write using temp file and rename
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .map_err(|e| ForemanError::System(format!("failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .map_err(|e| ForemanError::System(format!("failed to rename temp file: {}", e)))?;
    Ok(())
}
