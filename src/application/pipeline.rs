//! # Streaming Pipeline
//!
//! Glues the pieces together for a streamed response: every chunk is appended to the
//! turn's text, the whole text is re-parsed and reconciled, and changed turns are handed
//! to a background worker that drains them through the execution engine.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::application::engine::ExecutionEngine;
use crate::application::parsing::parse;
use crate::application::reconciler::{TurnHandle, TurnStore};
use crate::domain::error::EngineError;
use crate::domain::types::TurnRecord;

pub struct ArtifactPipeline {
    store: TurnStore,
    engine: Arc<ExecutionEngine>,
    texts: Mutex<HashMap<String, String>>,
}

impl ArtifactPipeline {
    /// Creates the pipeline and spawns its execution worker. Must be called inside a
    /// tokio runtime. The worker stops when the pipeline is dropped.
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<TurnHandle>>();

        let worker_engine = engine.clone();
        tokio::spawn(async move {
            while let Some(turn) = rx.recv().await {
                if let Err(e) = worker_engine.drain(&turn).await {
                    warn!("Drain of turn {} failed: {}", turn.id(), e);
                }
            }
            debug!("Execution worker stopped");
        });

        Self {
            store: TurnStore::with_notifier(tx),
            engine,
            texts: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn store(&self) -> &TurnStore {
        &self.store
    }

    /// Feeds the next chunk of response `turn_id`. Returns the turn once the response
    /// has produced something worth tracking.
    pub async fn push_chunk(&self, turn_id: &str, chunk: &str) -> Option<Arc<TurnHandle>> {
        let text = {
            let mut texts = self.texts.lock().await;
            let text = texts.entry(turn_id.to_string()).or_default();
            text.push_str(chunk);
            text.clone()
        };

        self.store.reconcile(turn_id, &parse(&text)).await
    }

    /// Marks the end of response `turn_id` and waits until every due step has been
    /// attempted. `None` if the response never contained anything to track.
    pub async fn finish(&self, turn_id: &str) -> Result<Option<TurnRecord>, EngineError> {
        self.texts.lock().await.remove(turn_id);
        let Some(turn) = self.store.get(turn_id).await else {
            return Ok(None);
        };

        loop {
            // Subscribe first so progress published between the drain and the check is seen.
            let mut updates = turn.subscribe();
            self.engine.drain(&turn).await?;

            let record = turn.snapshot();
            if !record.has_due_steps() {
                return Ok(Some(record));
            }

            // The worker holds the engine; wait for it to report progress.
            let _ = updates.changed().await;
        }
    }

    /// Forgets every turn and any half-received text, e.g. when the chat is cleared.
    pub async fn clear(&self) {
        self.texts.lock().await.clear();
        self.store.clear().await;
    }
}
