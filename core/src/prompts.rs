//! Fix representation and fix-prompt formatting.
//!
//! A [`Fix`] is either a free-text remediation instruction (usually
//! produced by error analysis) or an analyzer-rule violation with a
//! structured edit. The union is closed: the formatter matches it
//! exhaustively, so an unhandled variant is a compile error rather than
//! a silently skipped fix.

use std::fmt::Write as _;

use tracing::debug;

use crate::error::{Error, Result};

/// Category label used for grouping free-text fixes in batched prompts.
const AGENT_PROMPT_CATEGORY: &str = "AGENT_PROMPT";

/// A structured edit suggestion attached to a rule violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub file: String,
    pub line: Option<u32>,
    pub suggestion: Option<String>,
}

/// One remediation action. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fix {
    /// Free-text instruction for the agent, with optional supporting
    /// context (e.g. the offending diagnostic lines).
    AgentPrompt {
        instruction: String,
        context: Option<String>,
    },
    /// An analyzer-rule-derived fix: rule identifier, human message,
    /// and an optional structured edit.
    RuleViolation {
        rule: String,
        message: String,
        edit: Option<TextEdit>,
    },
}

impl Fix {
    /// Grouping key for batched prompts.
    pub fn category(&self) -> &str {
        match self {
            Fix::AgentPrompt { .. } => AGENT_PROMPT_CATEGORY,
            Fix::RuleViolation { rule, .. } => rule,
        }
    }
}

/// Renders fixes into the prompt the agent receives.
#[derive(Debug, Clone)]
pub struct FixPromptFormatter {
    system_instructions: String,
}

impl FixPromptFormatter {
    pub fn new(system_instructions: impl Into<String>) -> Self {
        Self {
            system_instructions: system_instructions.into(),
        }
    }

    /// One fix → a targeted prompt; several → a batched prompt with
    /// repeated categories grouped under an instance-count header.
    /// An empty list is a caller error.
    pub fn format(&self, fixes: &[Fix]) -> Result<String> {
        match fixes {
            [] => Err(Error::validation("fixes", "fix list cannot be empty")),
            [only] => Ok(self.format_single(only)),
            many => Ok(self.format_batch(many)),
        }
    }

    fn format_single(&self, fix: &Fix) -> String {
        let mut prompt = self.preamble();
        prompt.push_str("### SPECIFIC FIX TO APPLY\n");
        render_fix_body(&mut prompt, fix);
        debug!(category = fix.category(), "formatted targeted fix prompt");
        prompt
    }

    fn format_batch(&self, fixes: &[Fix]) -> String {
        // Group by category, preserving first-seen order.
        let mut categories: Vec<(&str, Vec<&Fix>)> = Vec::new();
        for fix in fixes {
            match categories.iter_mut().find(|(cat, _)| *cat == fix.category()) {
                Some((_, members)) => members.push(fix),
                None => categories.push((fix.category(), vec![fix])),
            }
        }

        let mut prompt = self.preamble();
        let _ = writeln!(prompt, "### FIXES TO APPLY ({} total)", fixes.len());
        prompt.push('\n');
        for (category, members) in &categories {
            if members.len() > 1 {
                let _ = writeln!(prompt, "{category} ({} instances):", members.len());
            } else {
                let _ = writeln!(prompt, "{category}:");
            }
            for (index, fix) in members.iter().enumerate() {
                let _ = write!(prompt, "{}. ", index + 1);
                render_fix_body(&mut prompt, fix);
            }
            prompt.push('\n');
        }
        debug!(
            fixes = fixes.len(),
            categories = categories.len(),
            "formatted batched fix prompt"
        );
        prompt
    }

    fn preamble(&self) -> String {
        format!("SYSTEM INSTRUCTIONS\n{}\n\n", self.system_instructions)
    }
}

fn render_fix_body(out: &mut String, fix: &Fix) {
    match fix {
        Fix::AgentPrompt {
            instruction,
            context,
        } => {
            let _ = writeln!(out, "{instruction}");
            if let Some(context) = context {
                let _ = writeln!(out, "\n### CONTEXT\n{context}");
            }
        }
        Fix::RuleViolation {
            rule,
            message,
            edit,
        } => {
            let _ = writeln!(out, "{rule}: {message}");
            if let Some(edit) = edit {
                match edit.line {
                    Some(line) => {
                        let _ = writeln!(out, "   in {}:{line}", edit.file);
                    }
                    None => {
                        let _ = writeln!(out, "   in {}", edit.file);
                    }
                }
                if let Some(suggestion) = &edit.suggestion {
                    let _ = writeln!(out, "   suggested replacement: {suggestion}");
                }
            }
        }
    }
}
