//! # Domain Traits
//!
//! The sandbox capability the execution engine drives, and the slot through which
//! the sandbox becomes available once it has booted.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::domain::error::SandboxError;

/// File system + process spawner. Paths are relative to the sandbox's work directory.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError>;

    async fn write_file(&self, path: &str, contents: Bytes) -> Result<(), SandboxError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    /// Spawn `program` with `args`. The process runs until it exits or is killed.
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn SandboxProcess>, SandboxError>;
}

/// Handle to a process spawned inside the sandbox.
#[async_trait]
pub trait SandboxProcess: Send {
    /// Combined stdout/stderr, one line per message. Can be taken once.
    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>>;

    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32, SandboxError>;

    async fn kill(&mut self) -> Result<(), SandboxError>;
}

/// Holds the sandbox once it is ready. Empty while the sandbox is still booting.
#[derive(Clone)]
pub struct SandboxSlot {
    tx: Arc<watch::Sender<Option<Arc<dyn Sandbox>>>>,
}

impl SandboxSlot {
    pub fn empty() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn ready(sandbox: Arc<dyn Sandbox>) -> Self {
        let slot = Self::empty();
        slot.set(sandbox);
        slot
    }

    pub fn set(&self, sandbox: Arc<dyn Sandbox>) {
        self.tx.send_replace(Some(sandbox));
    }

    pub fn current(&self) -> Option<Arc<dyn Sandbox>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<dyn Sandbox>>> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for SandboxSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSlot")
            .field("ready", &self.tx.borrow().is_some())
            .finish()
    }
}
