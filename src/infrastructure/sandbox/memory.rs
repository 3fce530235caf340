//! # In-Memory Sandbox
//!
//! A sandbox that keeps files in a map and only pretends to run commands.
//! Backs `--dry-run` replays and the engine tests; every effect is recorded in a journal.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::error::SandboxError;
use crate::domain::paths;
use crate::domain::traits::{Sandbox, SandboxProcess};

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
    journal: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct MemorySandbox {
    state: Arc<Mutex<MemoryState>>,
    exit_codes: HashMap<String, i32>,
    hanging: HashSet<String>,
    failing_paths: HashSet<String>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// `program` exits with `code` instead of 0.
    pub fn with_exit_code(mut self, program: &str, code: i32) -> Self {
        self.exit_codes.insert(program.to_string(), code);
        self
    }

    /// `program` never exits on its own.
    pub fn with_hanging(mut self, program: &str) -> Self {
        self.hanging.insert(program.to_string());
        self
    }

    /// Writes to `path` fail with an io error.
    pub fn with_failing_path(mut self, path: &str) -> Self {
        self.failing_paths.insert(paths::normalize(path));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every effect applied so far, e.g. `write src/main.rs` or `spawn npm install`.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&paths::normalize(path))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.lock()
            .files
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect()
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError> {
        let path = paths::normalize(path);
        self.lock()
            .files
            .get(&path)
            .cloned()
            .ok_or(SandboxError::NotFound(path))
    }

    async fn write_file(&self, path: &str, contents: Bytes) -> Result<(), SandboxError> {
        let path = paths::normalize(path);
        if self.failing_paths.contains(&path) {
            return Err(SandboxError::Io {
                path: path.into(),
                source: std::io::Error::other("simulated write failure"),
            });
        }

        let mut state = self.lock();
        if let Some(parent) = paths::parent(&path)
            && !state.dirs.contains(parent)
        {
            return Err(SandboxError::NotFound(parent.to_string()));
        }
        state.journal.push(format!("write {path}"));
        state.files.insert(path, contents);
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let path = paths::normalize(path);
        let mut state = self.lock();

        if state.dirs.contains(&path) {
            return if recursive {
                Ok(())
            } else {
                Err(SandboxError::AlreadyExists(path))
            };
        }
        if !recursive
            && let Some(parent) = paths::parent(&path)
            && !state.dirs.contains(parent)
        {
            return Err(SandboxError::NotFound(parent.to_string()));
        }

        let mut current = String::new();
        for segment in path.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            state.dirs.insert(current.clone());
        }
        state.journal.push(format!("mkdir {path}"));
        Ok(())
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let path = paths::normalize(path);
        let mut state = self.lock();

        if state.files.remove(&path).is_some() {
            state.journal.push(format!("remove {path}"));
            return Ok(());
        }
        if !state.dirs.contains(&path) {
            return Err(SandboxError::NotFound(path));
        }

        let prefix = format!("{path}/");
        let has_children = state.files.keys().any(|k| k.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix));
        if has_children && !recursive {
            return Err(SandboxError::Io {
                path: path.into(),
                source: std::io::Error::other("directory not empty"),
            });
        }

        state.files.retain(|k, _| !k.starts_with(&prefix));
        state.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
        state.journal.push(format!("remove {path}"));
        Ok(())
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn SandboxProcess>, SandboxError> {
        let command_line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.lock().journal.push(format!("spawn {command_line}"));

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(format!("$ {command_line}"));

        Ok(Box::new(MemoryProcess {
            command_line,
            exit_code: self.exit_codes.get(program).copied().unwrap_or(0),
            hanging: self.hanging.contains(program),
            output: Some(rx),
            state: self.state.clone(),
        }))
    }
}

struct MemoryProcess {
    command_line: String,
    exit_code: i32,
    hanging: bool,
    output: Option<mpsc::UnboundedReceiver<String>>,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl SandboxProcess for MemoryProcess {
    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32, SandboxError> {
        if self.hanging {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.journal.push(format!("kill {}", self.command_line));
        Ok(())
    }
}
