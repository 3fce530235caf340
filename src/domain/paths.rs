//! # Sandbox Paths
//!
//! Single source of truth for how file paths from the model are keyed.
//! `./src/main.rs`, `/src/main.rs` and `src//main.rs` all name the same file.

/// Normalizes a path relative to the sandbox work directory.
/// `..` segments that would climb above the work directory are kept so callers can reject them.
pub fn normalize(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    parts.join("/")
}

/// Returns the parent directory of a normalized path, or `None` for top-level files.
pub fn parent(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx]).filter(|p| !p.is_empty())
}

/// True if the normalized path climbs out of the work directory.
pub fn escapes_root(path: &str) -> bool {
    path == ".." || path.starts_with("../")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./src/main.rs"), "src/main.rs");
        assert_eq!(normalize("/src/main.rs"), "src/main.rs");
        assert_eq!(normalize("src//lib/../main.rs"), "src/main.rs");
        assert_eq!(normalize("src\\main.rs"), "src/main.rs");
        assert_eq!(normalize("  index.html "), "index.html");
        assert_eq!(normalize("../secret"), "../secret");
        assert_eq!(normalize("a/../../b"), "../b");
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("src/app/main.rs"), Some("src/app"));
        assert_eq!(parent("main.rs"), None);
    }

    #[test]
    fn test_escapes_root() {
        assert!(escapes_root(&normalize("../x")));
        assert!(!escapes_root(&normalize("a/../x")));
        assert!(!escapes_root("..hidden"));
    }
}
