//! # Modification Differ
//!
//! Turns edited files into the `<file_modifications>` block that is sent back to the model
//! with the next prompt, so it knows what the user changed.

use std::collections::BTreeMap;

use similar::{ChangeTag, TextDiff};

use crate::application::shadow::ShadowFileStore;
use crate::domain::types::{Modification, ModificationForm};

pub const MODIFICATIONS_TAG: &str = "file_modifications";

const CONTEXT_LINES: usize = 3;

/// Diffs `original` against `current`. `None` if they are equal.
///
/// Falls back to the full content when the changed lines alone outweigh the current file,
/// which is what happens on rewrites.
pub fn diff(path: &str, original: &str, current: &str) -> Option<Modification> {
    if original == current {
        return None;
    }

    let text_diff = TextDiff::from_lines(original, current);

    let changed_bytes: usize = text_diff
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .map(|change| change.value().len() + 1)
        .sum();

    if changed_bytes > current.len() {
        return Some(Modification {
            path: path.to_string(),
            form: ModificationForm::FullContent,
            payload: current.to_string(),
        });
    }

    let payload = text_diff
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(path, path)
        .to_string();

    Some(Modification {
        path: path.to_string(),
        form: ModificationForm::Diff,
        payload,
    })
}

/// Diffs each of `paths` between `originals` and the shadow store, in the given order.
/// A path missing on either side is treated as an empty file. A file removed from the shadow
/// store is therefore reported as `FullContent` with an empty payload, the same as a file
/// that was emptied; the report does not distinguish the two.
pub async fn diff_all(
    paths: &[String],
    shadow: &ShadowFileStore,
    originals: &BTreeMap<String, String>,
) -> Vec<Modification> {
    let current = shadow.snapshot().await;
    paths
        .iter()
        .filter_map(|path| {
            let before = originals.get(path).map(String::as_str).unwrap_or("");
            let after = current.get(path).map(String::as_str).unwrap_or("");
            diff(path, before, after)
        })
        .collect()
}

/// Serializes modifications into a single tagged block. Empty when there is nothing to report.
pub fn render_modifications(modifications: &[Modification]) -> String {
    if modifications.is_empty() {
        return String::new();
    }

    let mut out = format!("<{MODIFICATIONS_TAG}>\n");
    for modification in modifications {
        let tag = match modification.form {
            ModificationForm::Diff => "diff",
            ModificationForm::FullContent => "file",
        };
        let path = modification.path.replace('&', "&amp;").replace('"', "&quot;");
        out.push_str(&format!("<{tag} path=\"{path}\">\n"));
        out.push_str(&modification.payload);
        if !modification.payload.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("</{tag}>\n"));
    }
    out.push_str(&format!("</{MODIFICATIONS_TAG}>"));
    out
}
