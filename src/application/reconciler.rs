//! # Step Reconciler
//!
//! Folds every fresh parse of a response into that response's canonical `TurnRecord`.
//! Steps keep the order in which their operations first appeared, `complete` never reverts,
//! and steps are never removed. Each turn is published through a `watch` channel so
//! observers always read a whole, consistent version.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::domain::types::{
    Operation, OperationKind, ParseResult, Step, StepKey, StepOutcome, TurnRecord,
};

/// Shared, observable turn record.
#[derive(Debug)]
pub struct TurnHandle {
    id: String,
    tx: watch::Sender<TurnRecord>,
}

impl TurnHandle {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let (tx, _rx) = watch::channel(TurnRecord::new(id.clone()));
        Self { id, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> TurnRecord {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnRecord> {
        self.tx.subscribe()
    }

    /// Merges a parse result. Returns true if anything changed.
    pub fn apply_parse(&self, parse: &ParseResult) -> bool {
        self.tx.send_if_modified(|record| merge(record, parse))
    }

    /// Clears `pending` on the step at `index` once its effect has been attempted.
    /// If the step was re-armed with a newer revision meanwhile it stays pending.
    pub fn mark_attempted(&self, index: usize, revision: u32, outcome: StepOutcome) -> bool {
        self.tx.send_if_modified(|record| match record.steps.get_mut(index) {
            Some(step) if step.revision == revision && step.pending => {
                step.pending = false;
                step.outcome = Some(outcome);
                true
            }
            _ => false,
        })
    }
}

/// Computes the identity key of each operation, in order.
pub fn step_keys(operations: &[Operation]) -> Vec<StepKey> {
    let mut commands = 0;
    let mut deletes: HashMap<String, u32> = HashMap::new();
    operations
        .iter()
        .map(|op| match op.kind {
            OperationKind::CreateFile | OperationKind::UpdateFile => {
                let path = op.file_path.clone().unwrap_or_default();
                let generation = deletes.get(&path).copied().unwrap_or(0);
                StepKey::FileWrite(path, generation)
            }
            OperationKind::DeleteFile => {
                let path = op.file_path.clone().unwrap_or_default();
                let count = deletes.entry(path.clone()).or_insert(0);
                let key = StepKey::Delete(path, *count);
                *count += 1;
                key
            }
            OperationKind::RunCommand => {
                let key = StepKey::Command(commands);
                commands += 1;
                key
            }
        })
        .collect()
}

/// Operations sharing a key collapse to one: the last complete one, else the last one.
fn fold_operations(operations: &[Operation]) -> Vec<(StepKey, &Operation)> {
    let mut folded: Vec<(StepKey, &Operation)> = Vec::new();
    let mut index: HashMap<StepKey, usize> = HashMap::new();

    for (key, op) in step_keys(operations).into_iter().zip(operations) {
        match index.get(&key) {
            Some(&i) => {
                let current = &mut folded[i].1;
                if op.complete || !current.complete {
                    *current = op;
                }
            }
            None => {
                index.insert(key.clone(), folded.len());
                folded.push((key, op));
            }
        }
    }

    folded
}

fn new_step(key: StepKey, op: &Operation) -> Step {
    Step {
        key,
        kind: op.kind,
        file_path: op.file_path.clone(),
        command: op.command.clone(),
        content: op.content.clone(),
        pending: true,
        complete: op.complete,
        revision: 0,
        outcome: None,
    }
}

/// Merges `parse` into `record` in place. Returns true if the record changed.
pub fn merge(record: &mut TurnRecord, parse: &ParseResult) -> bool {
    let mut changed = false;

    if record.preceding_text != parse.preamble {
        record.preceding_text = parse.preamble.clone();
        changed = true;
    }
    if record.trailing_text != parse.epilogue {
        record.trailing_text = parse.epilogue.clone();
        changed = true;
    }
    if parse.title.is_some() && record.title != parse.title {
        record.title = parse.title.clone();
        changed = true;
    }
    if parse.artifact_id.is_some() && record.artifact_id != parse.artifact_id {
        record.artifact_id = parse.artifact_id.clone();
        changed = true;
    }

    for (key, op) in fold_operations(&parse.operations) {
        let Some(step) = record.steps.iter_mut().find(|s| s.key == key) else {
            record.steps.push(new_step(key, op));
            changed = true;
            continue;
        };

        if !step.complete {
            if step.content != op.content || step.complete != op.complete || step.kind != op.kind
            {
                step.kind = op.kind;
                step.command = op.command.clone();
                step.content = op.content.clone();
                step.complete = op.complete;
                changed = true;
            }
        } else if op.complete && step.content != op.content {
            step.kind = op.kind;
            step.command = op.command.clone();
            step.content = op.content.clone();
            step.revision += 1;
            step.pending = true;
            step.outcome = None;
            changed = true;
        }
    }

    changed
}

/// All turns of one conversation, keyed by response id.
#[derive(Debug, Default)]
pub struct TurnStore {
    turns: Mutex<Vec<Arc<TurnHandle>>>,
    notifier: Option<mpsc::UnboundedSender<Arc<TurnHandle>>>,
}

impl TurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every changed turn is sent to `notifier`; the execution worker listens on the other end.
    pub fn with_notifier(notifier: mpsc::UnboundedSender<Arc<TurnHandle>>) -> Self {
        Self {
            turns: Mutex::new(Vec::new()),
            notifier: Some(notifier),
        }
    }

    /// Reconciles a parse into the turn `turn_id`. The turn is created on the first
    /// non-empty parse; an empty parse for an unknown turn returns `None`.
    pub async fn reconcile(&self, turn_id: &str, parse: &ParseResult) -> Option<Arc<TurnHandle>> {
        let handle = {
            let mut turns = self.turns.lock().await;
            match turns.iter().find(|t| t.id() == turn_id) {
                Some(handle) => handle.clone(),
                None if parse.is_empty() => return None,
                None => {
                    let handle = Arc::new(TurnHandle::new(turn_id));
                    turns.push(handle.clone());
                    handle
                }
            }
        };

        if handle.apply_parse(parse) {
            if let Some(notifier) = &self.notifier
                && notifier.send(handle.clone()).is_err()
            {
                tracing::debug!("Execution worker is gone; turn {} not scheduled", turn_id);
            }
        }

        Some(handle)
    }

    pub async fn get(&self, turn_id: &str) -> Option<Arc<TurnHandle>> {
        self.turns.lock().await.iter().find(|t| t.id() == turn_id).cloned()
    }

    /// Turns in creation order.
    pub async fn turns(&self) -> Vec<Arc<TurnHandle>> {
        self.turns.lock().await.clone()
    }

    /// Discards every turn, e.g. when the conversation is cleared.
    pub async fn clear(&self) {
        self.turns.lock().await.clear();
    }
}
