//! # Domain Types
//!
//! Data structures shared by the parser, the reconciler, the execution engine and the differ.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// What an operation does to the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    CreateFile,
    UpdateFile,
    DeleteFile,
    RunCommand,
}

impl OperationKind {
    pub fn is_file_write(self) -> bool {
        matches!(self, OperationKind::CreateFile | OperationKind::UpdateFile)
    }
}

/// A single operation as seen by one parse of the streamed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub content: String,
    pub complete: bool,
}

/// Output of the action parser for one snapshot of the cumulative text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseResult {
    pub preamble: String,
    pub operations: Vec<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    /// Prose after the closing artifact marker.
    #[serde(default)]
    pub epilogue: String,
}

impl ParseResult {
    pub fn is_empty(&self) -> bool {
        self.preamble.is_empty() && self.operations.is_empty() && self.title.is_none()
    }
}

/// Identity of a step within a turn.
///
/// Creates and updates of one path share a key so repeated writes collapse into one step.
/// The second field counts the deletes of that path earlier in the text, so a write after
/// a delete becomes a new step instead of folding into one that runs before the delete.
/// Commands are keyed by their position among commands, never by their text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKey {
    FileWrite(String, u32),
    Delete(String, u32),
    Command(usize),
}

/// Result of the engine's attempt at a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub key: StepKey,
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub content: String,
    pub pending: bool,
    pub complete: bool,
    /// Bumped whenever a later complete operation replaces the content of a complete step.
    pub revision: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepOutcome>,
}

impl Step {
    pub fn is_due(&self) -> bool {
        self.pending && self.complete
    }

    /// Short label for logs, e.g. `write src/main.rs` or `run npm install`.
    pub fn label(&self) -> String {
        match self.kind {
            OperationKind::CreateFile | OperationKind::UpdateFile => {
                format!("write {}", self.file_path.as_deref().unwrap_or(""))
            }
            OperationKind::DeleteFile => {
                format!("delete {}", self.file_path.as_deref().unwrap_or(""))
            }
            OperationKind::RunCommand => format!("run {}", self.command.as_deref().unwrap_or("")),
        }
    }
}

/// Canonical record of one model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub preceding_text: String,
    #[serde(default)]
    pub trailing_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Local>,
}

impl TurnRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            preceding_text: String::new(),
            trailing_text: String::new(),
            title: None,
            artifact_id: None,
            steps: Vec::new(),
            created_at: Local::now(),
        }
    }

    pub fn has_due_steps(&self) -> bool {
        self.steps.iter().any(Step::is_due)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationForm {
    Diff,
    FullContent,
}

/// A changed file, ready to be reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub path: String,
    pub form: ModificationForm,
    pub payload: String,
}
