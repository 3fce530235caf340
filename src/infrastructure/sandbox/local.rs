//! # Local Sandbox
//!
//! Runs the sandbox capability against a directory on the host.
//! Every path is resolved inside the root directory; anything that would escape it is refused.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::domain::error::SandboxError;
use crate::domain::paths;
use crate::domain::traits::{Sandbox, SandboxProcess};

#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    /// Opens (creating if needed) the work directory at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SandboxError::from_io(&root, e))?;
        let root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|e| SandboxError::from_io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a sandbox path to a host path inside the root.
    /// Non-existent paths are checked through their nearest existing ancestor so symlinks
    /// can't be used to step outside.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let normalized = paths::normalize(path);
        if paths::escapes_root(&normalized) {
            return Err(SandboxError::PathEscape(path.to_string()));
        }

        let target = self.root.join(&normalized);
        let mut current = target.clone();
        let mut relative_parts = Vec::new();

        let resolved = loop {
            if current.exists() {
                let mut canonical = current
                    .canonicalize()
                    .map_err(|e| SandboxError::from_io(&current, e))?;
                for part in relative_parts.iter().rev() {
                    canonical.push(part);
                }
                break canonical;
            }

            match (current.parent(), current.file_name()) {
                (Some(parent), Some(name)) => {
                    relative_parts.push(name.to_owned());
                    current = parent.to_path_buf();
                }
                _ => return Err(SandboxError::PathEscape(path.to_string())),
            }
        };

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(SandboxError::PathEscape(path.to_string()))
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn read_file(&self, path: &str) -> Result<Bytes, SandboxError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read(&resolved)
            .await
            .map(Bytes::from)
            .map_err(|e| SandboxError::from_io(path, e))
    }

    async fn write_file(&self, path: &str, contents: Bytes) -> Result<(), SandboxError> {
        let resolved = self.resolve(path)?;
        tokio::fs::write(&resolved, &contents)
            .await
            .map_err(|e| SandboxError::from_io(path, e))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let resolved = self.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&resolved).await
        } else {
            tokio::fs::create_dir(&resolved).await
        };
        result.map_err(|e| SandboxError::from_io(path, e))
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| SandboxError::from_io(path, e))?;

        let result = if !metadata.is_dir() {
            tokio::fs::remove_file(&resolved).await
        } else if recursive {
            tokio::fs::remove_dir_all(&resolved).await
        } else {
            tokio::fs::remove_dir(&resolved).await
        };
        result.map_err(|e| SandboxError::from_io(path, e))
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn SandboxProcess>, SandboxError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        Ok(Box::new(LocalProcess {
            child,
            output: Some(rx),
        }))
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

struct LocalProcess {
    child: Child,
    output: Option<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32, SandboxError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SandboxError::from_io("<process>", e))?;
        // Killed by a signal: no exit code.
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.child
            .kill()
            .await
            .map_err(|e| SandboxError::from_io("<process>", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::open(dir.path()).await.unwrap();

        sandbox.mkdir("src/app", true).await.unwrap();
        sandbox
            .write_file("src/app/main.rs", Bytes::from_static(b"fn main() {}"))
            .await
            .unwrap();
        let read = sandbox.read_file("./src/app/main.rs").await.unwrap();
        assert_eq!(&read[..], b"fn main() {}");

        assert!(matches!(
            sandbox.mkdir("src", false).await,
            Err(SandboxError::AlreadyExists(_))
        ));

        sandbox.remove("src", true).await.unwrap();
        assert!(!dir.path().join("src").exists());
        assert!(matches!(
            sandbox.remove("src", true).await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_path_escape_is_refused() {
        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::open(dir.path().join("root")).await.unwrap();

        assert!(matches!(
            sandbox.resolve("../outside.txt"),
            Err(SandboxError::PathEscape(_))
        ));
        assert!(matches!(
            sandbox
                .write_file("a/../../outside.txt", Bytes::from_static(b"x"))
                .await,
            Err(SandboxError::PathEscape(_))
        ));
        assert!(sandbox.resolve("/nested/new.txt").unwrap().starts_with(sandbox.root()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_collects_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::open(dir.path()).await.unwrap();

        let mut process = sandbox
            .spawn("sh", &["-c".to_string(), "echo hello; exit 3".to_string()])
            .await
            .unwrap();
        let mut output = process.take_output().unwrap();
        assert_eq!(process.wait().await.unwrap(), 3);
        assert_eq!(output.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_spawn_unknown_program_fails() {
        let dir = TempDir::new().unwrap();
        let sandbox = LocalSandbox::open(dir.path()).await.unwrap();
        let result = sandbox.spawn("definitely-not-a-real-program-xyz", &[]).await;
        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }
}
