//! # Prompts
//!
//! Model-facing text for the artifact protocol: the instructions that teach the model the
//! envelope the parser understands, and the wrapper that reports the user's edits back.

use crate::application::differ::render_modifications;
use crate::domain::types::Modification;

/// Fills `{{KEY}}` placeholders in a template.
pub struct PromptRenderer<'a> {
    template: &'a str,
    replacements: Vec<(&'a str, String)>,
}

impl<'a> PromptRenderer<'a> {
    pub fn new(template: &'a str) -> Self {
        Self {
            template,
            replacements: Vec::new(),
        }
    }

    pub fn set(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.replacements.push((key, value.into()));
        self
    }

    pub fn render(self) -> String {
        let mut result = self.template.to_string();
        for (key, value) in self.replacements {
            result = result.replace(key, &value);
        }

        if let Some(start) = result.find("{{")
            && let Some(end) = result[start..].find("}}")
        {
            tracing::error!(
                "Unreplaced placeholder in prompt: {}",
                &result[start..start + end + 2]
            );
        }

        result
    }
}

pub const ARTIFACT_INSTRUCTIONS: &str = concat!(
    "You are working inside a sandbox rooted at {{WORK_DIR}}.\n",
    "\n",
    "To create a project, reply with a short explanation followed by ONE artifact:\n",
    "\n",
    "<Artifact id=\"kebab-case-id\" title=\"Short title\">\n",
    "<Action type=\"file\" filePath=\"relative/path.ext\">\n",
    "FULL FILE CONTENT\n",
    "</Action>\n",
    "<Action type=\"shell\">\n",
    "command to run\n",
    "</Action>\n",
    "</Artifact>\n",
    "\n",
    "Rules:\n",
    "- Actions run in the order you write them. Create files before the commands that use them.\n",
    "- Always write the complete content of a file, never a fragment or a placeholder.\n",
    "- File paths are relative to the sandbox root.\n",
    "- Install dependencies with a shell action before starting anything.\n",
    "- A file may appear more than once; the last complete version wins.\n",
    "- The user may edit files between turns. Their edits arrive in a <{{MODIFICATIONS_TAG}}> block:\n",
    "  <diff> holds a unified diff, <file> holds the full new content. Treat them as the current state.\n",
);

/// Instructions for the model, bound to the sandbox root it works in.
pub fn artifact_instructions(work_dir: &str) -> String {
    PromptRenderer::new(ARTIFACT_INSTRUCTIONS)
        .set("{{WORK_DIR}}", work_dir)
        .set("{{MODIFICATIONS_TAG}}", crate::application::differ::MODIFICATIONS_TAG)
        .render()
}

/// Prefixes the user's next message with the edits made since the last turn.
pub fn with_modifications(modifications: &[Modification], message: &str) -> String {
    let block = render_modifications(modifications);
    if block.is_empty() {
        message.to_string()
    } else {
        format!("{block}\n\n{message}")
    }
}
