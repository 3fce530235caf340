//! # Artifact Parser
//!
//! Interprets the model's cumulative response text into a preamble and an ordered list of
//! operations. Called on every streamed chunk with the whole text so far, so it must be a
//! pure function of its input and must tolerate any truncation point.
//!
//! Wire grammar:
//!
//! ```text
//! prose...
//! <Artifact id="..." title="...">
//!   <Action type="file" filePath="src/main.rs">CONTENT</Action>
//!   <Action type="shell">npm install</Action>
//! </Artifact>
//! prose...
//! ```
//!
//! `file` and `shell` are the canonical action types. `create`/`update` are read as `file`,
//! `command` as `shell`, and `delete` (which has no canonical spelling) removes `filePath`.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::paths;
use crate::domain::types::{Operation, OperationKind, ParseResult};

const ARTIFACT_OPEN: &str = "<Artifact";
const ARTIFACT_CLOSE: &str = "</Artifact>";
const ACTION_OPEN: &str = "<Action";
const ACTION_CLOSE: &str = "</Action>";

static ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Where a marker sits in the text.
#[derive(Debug, PartialEq)]
enum Marker {
    /// Full marker followed by whitespace, `>` or `/`.
    Found(usize),
    /// The text ends inside (or right after) the marker, so it can't be decided yet.
    Partial(usize),
    NotFound,
}

fn find_marker(text: &str, marker: &str, from: usize) -> Marker {
    let mut search = from;
    while let Some(rel) = text[search..].find(marker) {
        let idx = search + rel;
        let after = idx + marker.len();
        match text[after..].chars().next() {
            None => return Marker::Partial(idx),
            Some(c) if c.is_whitespace() || c == '>' || c == '/' => return Marker::Found(idx),
            Some(_) => search = after,
        }
    }

    match partial_suffix_len(&text[from..], marker) {
        0 => Marker::NotFound,
        n => Marker::Partial(text.len() - n),
    }
}

/// Length of the longest suffix of `text` that is a strict prefix of `marker`.
fn partial_suffix_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&n| text.ends_with(&marker[..n]))
        .unwrap_or(0)
}

/// Drops a trailing strict prefix of `marker`, which may still turn into the marker.
fn hold_back<'a>(text: &'a str, marker: &str) -> &'a str {
    &text[..text.len() - partial_suffix_len(text, marker)]
}

fn parse_attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE_REGEX
        .captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_string();
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
            Some((name, unescape(value)))
        })
        .collect()
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Index of the `>` closing the open tag that starts at `from`, skipping quoted values.
fn find_tag_end(text: &str, from: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in text[from..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(from + i),
            (None, _) => {}
        }
    }
    None
}

/// Content conventionally starts on the line after the open tag.
fn strip_leading_newline(content: &str) -> &str {
    content
        .strip_prefix("\r\n")
        .or_else(|| content.strip_prefix('\n'))
        .unwrap_or(content)
}

enum ActionType {
    File,
    Delete,
    Shell,
}

fn action_type(attrs: &HashMap<String, String>) -> Option<ActionType> {
    match attrs.get("type")?.trim().to_ascii_lowercase().as_str() {
        "file" | "create" | "update" => Some(ActionType::File),
        "delete" => Some(ActionType::Delete),
        "shell" | "command" => Some(ActionType::Shell),
        _ => None,
    }
}

/// Parses the cumulative response text. Never fails: truncated or malformed markup simply
/// yields fewer or incomplete operations.
pub fn parse(text: &str) -> ParseResult {
    let mut result = ParseResult::default();

    let start = match find_marker(text, ARTIFACT_OPEN, 0) {
        Marker::Found(idx) => idx,
        Marker::Partial(idx) => {
            result.preamble = text[..idx].to_string();
            return result;
        }
        Marker::NotFound => {
            result.preamble = text.to_string();
            return result;
        }
    };
    result.preamble = text[..start].to_string();

    let Some(tag_end) = find_tag_end(text, start) else {
        return result;
    };
    let artifact_attrs = parse_attributes(&text[start + ARTIFACT_OPEN.len()..tag_end]);
    result.title = artifact_attrs.get("title").cloned();
    result.artifact_id = artifact_attrs.get("id").cloned();

    // A self-closing artifact carries no actions.
    if text[..tag_end].ends_with('/') {
        result.epilogue = text[tag_end + 1..].to_string();
        return result;
    }

    let mut seen_files: HashSet<String> = HashSet::new();
    let mut cursor = tag_end + 1;

    loop {
        let close = text[cursor..].find(ARTIFACT_CLOSE).map(|i| cursor + i);
        let action_start = match find_marker(text, ACTION_OPEN, cursor) {
            Marker::Found(idx) if close.is_none_or(|c| idx < c) => idx,
            _ => {
                if let Some(close) = close {
                    result.epilogue = text[close + ARTIFACT_CLOSE.len()..].to_string();
                }
                break;
            }
        };

        let Some(open_end) = find_tag_end(text, action_start) else {
            break;
        };
        let attrs = parse_attributes(&text[action_start + ACTION_OPEN.len()..open_end]);
        let content_start = open_end + 1;

        let (raw_content, complete, next_cursor) = if text[..open_end].ends_with('/') {
            // Self-closing: no content, nothing more to wait for.
            ("", true, content_start)
        } else {
            match text[content_start..].find(ACTION_CLOSE) {
                Some(rel) => {
                    let end = content_start + rel;
                    (&text[content_start..end], true, end + ACTION_CLOSE.len())
                }
                None => (hold_back(&text[content_start..], ACTION_CLOSE), false, text.len()),
            }
        };

        if let Some(operation) = build_operation(&attrs, raw_content, complete, &mut seen_files)
        {
            result.operations.push(operation);
        }

        if !complete {
            break;
        }
        cursor = next_cursor;
    }

    result
}

fn build_operation(
    attrs: &HashMap<String, String>,
    raw_content: &str,
    complete: bool,
    seen_files: &mut HashSet<String>,
) -> Option<Operation> {
    let file_path = attrs
        .get("filePath")
        .map(|p| paths::normalize(p))
        .filter(|p| !p.is_empty());

    match action_type(attrs)? {
        ActionType::File => {
            let path = file_path?;
            let kind = if seen_files.insert(path.clone()) {
                OperationKind::CreateFile
            } else {
                OperationKind::UpdateFile
            };
            Some(Operation {
                kind,
                file_path: Some(path),
                command: None,
                content: strip_leading_newline(raw_content).to_string(),
                complete,
            })
        }
        ActionType::Delete => {
            let path = file_path?;
            // A write after the delete creates the file again.
            seen_files.remove(&path);
            Some(Operation {
                kind: OperationKind::DeleteFile,
                file_path: Some(path),
                command: None,
                content: String::new(),
                complete,
            })
        }
        ActionType::Shell => {
            let command = raw_content.trim().to_string();
            Some(Operation {
                kind: OperationKind::RunCommand,
                file_path: None,
                command: Some(command.clone()),
                content: command,
                complete,
            })
        }
    }
}
