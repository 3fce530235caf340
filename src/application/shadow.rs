//! # Shadow File Store
//!
//! In-memory mirror of every file the engine has written into the sandbox. The editor reads
//! from it, and the differ compares it against the content a file had before the user
//! started editing it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::application::differ;
use crate::domain::paths;
use crate::domain::types::Modification;

#[derive(Debug, Default)]
struct ShadowState {
    files: BTreeMap<String, String>,
    /// Content of each user-edited file before its first edit.
    originals: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowFileStore {
    state: Arc<RwLock<ShadowState>>,
}

impl ShadowFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records content the engine wrote to the sandbox.
    pub async fn write(&self, path: &str, content: &str) {
        let path = paths::normalize(path);
        let mut state = self.state.write().await;
        state.files.insert(path, content.to_string());
    }

    /// Forgets a file the engine deleted. Returns the last known content.
    pub async fn remove(&self, path: &str) -> Option<String> {
        let path = paths::normalize(path);
        let mut state = self.state.write().await;
        state.originals.remove(&path);
        state.files.remove(&path)
    }

    pub async fn get(&self, path: &str) -> Option<String> {
        let path = paths::normalize(path);
        self.state.read().await.files.get(&path).cloned()
    }

    pub async fn paths(&self) -> Vec<String> {
        self.state.read().await.files.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.files.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.files.is_empty()
    }

    /// Copy of every file, keyed by normalized path.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.state.read().await.files.clone()
    }

    /// Applies an edit made in the editor. The first edit of a file remembers its previous
    /// content so the change can be reported back to the model.
    pub async fn save_edit(&self, path: &str, content: &str) {
        let path = paths::normalize(path);
        let mut state = self.state.write().await;
        let previous = state.files.get(&path).cloned().unwrap_or_default();
        state.originals.entry(path.clone()).or_insert(previous);
        state.files.insert(path, content.to_string());
    }

    /// Diffs every edited file against its content before the first edit.
    pub async fn modifications(&self) -> Vec<Modification> {
        let state = self.state.read().await;
        state
            .originals
            .iter()
            .filter_map(|(path, original)| {
                let current = state.files.get(path).map(String::as_str).unwrap_or("");
                differ::diff(path, original, current)
            })
            .collect()
    }

    /// Forgets recorded originals once their modifications have been reported.
    pub async fn reset_modifications(&self) {
        self.state.write().await.originals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ModificationForm;

    #[tokio::test]
    async fn test_write_get_remove() {
        let store = ShadowFileStore::new();
        store.write("./src/main.rs", "fn main() {}").await;
        store.write("src/main.rs", "fn main() { run() }").await;

        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.get("/src/main.rs").await.as_deref(),
            Some("fn main() { run() }")
        );
        assert_eq!(store.paths().await, vec!["src/main.rs".to_string()]);

        assert!(store.remove("src/main.rs").await.is_some());
        assert!(store.remove("src/main.rs").await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_edit_tracking() {
        let store = ShadowFileStore::new();
        store.write("a.txt", "line1\n").await;
        assert!(store.modifications().await.is_empty());

        store.save_edit("a.txt", "line1\nline2\n").await;
        store.save_edit("a.txt", "line1\nline2\nline3\n").await;

        let mods = store.modifications().await;
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].path, "a.txt");
        assert_eq!(mods[0].form, ModificationForm::Diff);
        assert!(mods[0].payload.contains("+line2"));
        assert!(mods[0].payload.contains("+line3"));

        store.reset_modifications().await;
        assert!(store.modifications().await.is_empty());
        assert_eq!(
            store.get("a.txt").await.as_deref(),
            Some("line1\nline2\nline3\n")
        );
    }

    #[tokio::test]
    async fn test_edit_back_to_original_is_not_a_modification() {
        let store = ShadowFileStore::new();
        store.write("a.txt", "same\n").await;
        store.save_edit("a.txt", "changed\n").await;
        store.save_edit("a.txt", "same\n").await;
        assert!(store.modifications().await.is_empty());
    }
}
