//! Per-chain outcomes and the checks run once every chain has exited.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::artifacts::{atomic_write_json_pretty, canonical_json_digest};
use crate::error::{ChainError, ChainFailure, Result};
use crate::invocation::Invocation;

#[derive(Debug, Clone, PartialEq)]
pub enum ChainStatus {
    Exited(i32),
    /// Terminated without an exit code (killed by a signal).
    Signaled,
    SpawnFailed(String),
}

impl ChainStatus {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exited(0) => "ok",
            Self::Exited(_) => "failed",
            Self::Signaled => "signaled",
            Self::SpawnFailed(_) => "spawn_failed",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "returned error code {}", code),
            Self::Signaled => write!(f, "was terminated by a signal"),
            Self::SpawnFailed(reason) => write!(f, "failed to start: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub index: usize,
    pub chain_id: u64,
    pub invocation: Invocation,
    pub status: ChainStatus,
    pub transcript_file: PathBuf,
    pub output_file: PathBuf,
    pub elapsed: Duration,
}

impl ChainOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.exit_code()
    }

    fn to_json(&self) -> Value {
        json!({
            "index": self.index,
            "chain_id": self.chain_id,
            "command": self.invocation.argv(),
            "status": self.status.as_str(),
            "exit_code": self.exit_code(),
            "detail": match &self.status {
                ChainStatus::SpawnFailed(reason) => Some(reason.clone()),
                _ => None,
            },
            "transcript_file": self.transcript_file.display().to_string(),
            "output_file": self.output_file.display().to_string(),
            "elapsed_ms": self.elapsed.as_millis() as u64,
        })
    }
}

/// Outcomes of one run, in chain order.
#[derive(Debug, Clone)]
pub struct RunResult {
    outcomes: Vec<ChainOutcome>,
    cores: usize,
    summary_file: Option<PathBuf>,
}

impl RunResult {
    pub fn new(outcomes: Vec<ChainOutcome>, cores: usize) -> Self {
        Self {
            outcomes,
            cores,
            summary_file: None,
        }
    }

    pub fn outcomes(&self) -> &[ChainOutcome] {
        &self.outcomes
    }

    pub fn chains(&self) -> usize {
        self.outcomes.len()
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn summary_file(&self) -> Option<&Path> {
        self.summary_file.as_deref()
    }

    pub fn transcript_files(&self) -> Vec<&Path> {
        self.outcomes
            .iter()
            .map(|o| o.transcript_file.as_path())
            .collect()
    }

    pub fn output_files(&self) -> Vec<&Path> {
        self.outcomes.iter().map(|o| o.output_file.as_path()).collect()
    }

    pub fn exit_codes(&self) -> Vec<Option<i32>> {
        self.outcomes.iter().map(ChainOutcome::exit_code).collect()
    }

    pub fn failures(&self) -> Vec<ChainFailure> {
        self.outcomes
            .iter()
            .filter(|o| !o.status.success())
            .map(|o| ChainFailure {
                chain_id: o.chain_id,
                status: o.status.clone(),
            })
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.success())
    }

    pub fn check_exit_codes(&self) -> Result<()> {
        let failures = self.failures();
        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            warn!(chain_id = failure.chain_id, "chain {}", failure.status);
        }
        Err(ChainError::ChainExecution {
            failures,
            result: Box::new(self.clone()),
        })
    }

    pub fn validate_outputs(&self) -> Result<()> {
        let mut reference: Option<(u64, Vec<String>)> = None;
        for outcome in &self.outcomes {
            let invalid = |reason: String| ChainError::OutputValidation {
                chain_id: outcome.chain_id,
                path: outcome.output_file.clone(),
                reason,
                result: Box::new(self.clone()),
            };
            let header = check_output_file(&outcome.output_file).map_err(invalid)?;
            match reference.as_ref() {
                None => reference = Some((outcome.chain_id, header)),
                Some((first_id, first)) if *first != header => {
                    return Err(invalid(format!(
                        "columns differ from chain {} ({} vs {} columns)",
                        first_id,
                        header.len(),
                        first.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Exit codes first, then output structure; validation never runs for a
    /// run with failed chains.
    pub fn ensure_success(&self) -> Result<()> {
        self.check_exit_codes()?;
        self.validate_outputs()
    }

    pub fn to_json(&self) -> Result<Value> {
        let commands: Vec<Vec<String>> = self
            .outcomes
            .iter()
            .map(|o| o.invocation.argv())
            .collect();
        Ok(json!({
            "schema_version": "chain_run_v1",
            "chains": self.chains(),
            "cores": self.cores,
            "all_succeeded": self.all_succeeded(),
            "commands_digest": canonical_json_digest(&json!(commands))?,
            "outcomes": self.outcomes.iter().map(ChainOutcome::to_json).collect::<Vec<_>>(),
            "written_at": Utc::now().to_rfc3339(),
        }))
    }

    /// Records `path` as the summary file only once it is on disk.
    pub fn write_summary(&mut self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json()?)?;
        self.summary_file = Some(path.to_path_buf());
        Ok(())
    }
}

/// Returns the header of a well-formed output file, or why it is not.
fn check_output_file(path: &Path) -> std::result::Result<Vec<String>, String> {
    if !path.is_file() {
        return Err("output file is missing".to_string());
    }
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| e.to_string())?;
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if header.iter().all(String::is_empty) {
        return Err("no header row".to_string());
    }
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        rows += 1;
        if record.len() != header.len() {
            return Err(format!(
                "row {} has {} columns, header has {}",
                rows,
                record.len(),
                header.len()
            ));
        }
    }
    if rows == 0 {
        return Err("no draws after header row".to_string());
    }
    Ok(header)
}
