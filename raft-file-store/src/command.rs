use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies a writer or lease holder (a client, or a node acting for one).
pub type ClientId = String;

/// File-mutating operations that flow through the Raft replicated log.
///
/// Reads never appear here; they are served from applied state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    CreateFile {
        path: String,
        content: Vec<u8>,
        writer: ClientId,
    },
    WriteFile {
        path: String,
        content: Vec<u8>,
        expected_version: u64,
        writer: ClientId,
    },
    DeleteFile {
        path: String,
        writer: ClientId,
    },
    AcquireLease {
        path: String,
        holder: ClientId,
        duration: Duration,
    },
    ReleaseLease {
        path: String,
        holder: ClientId,
    },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::CreateFile { path, .. }
            | Operation::WriteFile { path, .. }
            | Operation::DeleteFile { path, .. }
            | Operation::AcquireLease { path, .. }
            | Operation::ReleaseLease { path, .. } => path,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateFile { .. } => "create",
            Operation::WriteFile { .. } => "write",
            Operation::DeleteFile { .. } => "delete",
            Operation::AcquireLease { .. } => "acquire-lease",
            Operation::ReleaseLease { .. } => "release-lease",
        }
    }
}
