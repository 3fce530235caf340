//! # Errors
//!
//! Typed errors at the sandbox and engine seams. Application edges wrap these in `anyhow`.

use std::path::PathBuf;

/// Errors reported by a sandbox implementation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Path resolves outside the sandbox root
    #[error("path escapes sandbox root: {0}")]
    PathEscape(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },
}

impl SandboxError {
    /// Maps an io error onto the benign kinds the engine knows how to swallow.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.display().to_string()),
            std::io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            _ => Self::Io { path, source },
        }
    }
}

/// Terminal errors of a drain pass.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("sandbox was not ready after {attempts} attempts")]
    SandboxUnavailable { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = SandboxError::from_io(
            "a/b",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, SandboxError::NotFound(ref p) if p == "a/b"));

        let err = SandboxError::from_io(
            "a",
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exists"),
        );
        assert!(matches!(err, SandboxError::AlreadyExists(_)));

        let err = SandboxError::from_io(
            "a",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(err.to_string().starts_with("io error on a"));
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::SandboxUnavailable { attempts: 3 };
        assert_eq!(err.to_string(), "sandbox was not ready after 3 attempts");
    }
}
