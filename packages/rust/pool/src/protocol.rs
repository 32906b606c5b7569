//! Messages exchanged between the pool and its workers.
//!
//! Shapes on the wire:
//! - request `{"id": "1", "url": "..."}`
//! - control `{"cmd": "shutdown"}`
//! - success `{"id": "1", "recaps": [...]}`
//! - failure `{"id": "1", "error": "..."}`

use serde::{Deserialize, Serialize};

use recapsync_shared::ParsedRecap;

/// Job identifier: the decimal string of a per-pool counter starting at 1.
pub type JobId = String;

/// Commands a worker understands outside of parse jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    /// Release the session and exit.
    Shutdown,
}

/// Pool → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerRequest {
    Parse { id: JobId, url: String },
    Control { cmd: ControlCommand },
}

impl WorkerRequest {
    pub fn shutdown() -> Self {
        Self::Control {
            cmd: ControlCommand::Shutdown,
        }
    }
}

/// Worker → pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    Recaps { id: JobId, recaps: Vec<ParsedRecap> },
    Failed { id: JobId, error: String },
}

impl WorkerResponse {
    /// The job this response settles.
    pub fn id(&self) -> &str {
        match self {
            Self::Recaps { id, .. } | Self::Failed { id, .. } => id,
        }
    }
}
