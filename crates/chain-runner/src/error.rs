use std::path::PathBuf;

use thiserror::Error;

use crate::outcome::{ChainStatus, RunResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ChainFailure {
    pub chain_id: u64,
    pub status: ChainStatus,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("chain {chain_id} could not be started: {source}")]
    SpawnFailure {
        chain_id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("error during sampling{}", describe_failures(.failures))]
    ChainExecution {
        failures: Vec<ChainFailure>,
        result: Box<RunResult>,
    },

    #[error("chain {chain_id} produced an invalid output file {}: {reason}", .path.display())]
    OutputValidation {
        chain_id: u64,
        path: PathBuf,
        reason: String,
        result: Box<RunResult>,
    },

    #[error("model compilation failed: {0}")]
    Compile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChainError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// The run a chain or validation failure was raised for, if any.
    pub fn run_result(&self) -> Option<&RunResult> {
        match self {
            Self::ChainExecution { result, .. } | Self::OutputValidation { result, .. } => {
                Some(result)
            }
            _ => None,
        }
    }

    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

fn describe_failures(failures: &[ChainFailure]) -> String {
    failures
        .iter()
        .map(|f| format!(", chain {} {}", f.chain_id, f.status))
        .collect()
}

pub type Result<T> = std::result::Result<T, ChainError>;
