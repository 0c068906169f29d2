//! Error-log analysis capability.
//!
//! The substance of AI-driven analysis lives outside this crate; the
//! orchestrator only sees the [`ErrorAnalysis`] trait. The shipped
//! [`LogPatternAnalyzer`] is the deterministic half: it lifts compiler
//! diagnostics out of raw build output into rule-derived [`Fix`] values,
//! and falls back to a single free-text fix when the output matches no
//! known diagnostic shape.

use async_trait::async_trait;
use regex_lite::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::prompts::{Fix, TextEdit};

/// Opaque request/response capability turning build output into fixes.
#[async_trait]
pub trait ErrorAnalysis: Send + Sync {
    async fn analyze(&self, error_logs: &str, cancel: &CancellationToken) -> Result<Vec<Fix>>;
}

/// Deterministic diagnostic-line parser.
///
/// Recognizes the two shapes spec compilers emit:
/// `file.tsp:12:5 - error code: message` and `error code: message`.
pub struct LogPatternAnalyzer {
    located: Regex,
    bare: Regex,
}

impl LogPatternAnalyzer {
    // Both patterns are static and known-good; construction cannot
    // fail at runtime.
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            located: Regex::new(
                r"([^\s:]+\.(?:tsp|yaml)):(\d+)(?::\d+)?\s*-\s*error\s+([A-Za-z0-9_./-]+):\s*(.+)",
            )
            .expect("located diagnostic pattern is valid"),
            bare: Regex::new(r"error\s+([A-Za-z0-9_./-]+):\s*(.+)")
                .expect("bare diagnostic pattern is valid"),
        }
    }

    fn parse_line(&self, line: &str) -> Option<Fix> {
        if let Some(caps) = self.located.captures(line) {
            return Some(Fix::RuleViolation {
                rule: caps[3].to_string(),
                message: caps[4].trim().to_string(),
                edit: Some(TextEdit {
                    file: caps[1].to_string(),
                    line: caps[2].parse().ok(),
                    suggestion: None,
                }),
            });
        }
        if let Some(caps) = self.bare.captures(line) {
            return Some(Fix::RuleViolation {
                rule: caps[1].to_string(),
                message: caps[2].trim().to_string(),
                edit: None,
            });
        }
        None
    }
}

impl Default for LogPatternAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ErrorAnalysis for LogPatternAnalyzer {
    async fn analyze(&self, error_logs: &str, _cancel: &CancellationToken) -> Result<Vec<Fix>> {
        if error_logs.trim().is_empty() {
            return Ok(Vec::new());
        }

        let fixes: Vec<Fix> = error_logs
            .lines()
            .filter_map(|line| self.parse_line(line))
            .collect();

        if fixes.is_empty() {
            // Nothing matched a known diagnostic shape; hand the raw
            // output to the agent as one free-text fix.
            debug!("no structured diagnostics recognized, falling back to free-text fix");
            return Ok(vec![Fix::AgentPrompt {
                instruction: "Fix the build errors reported below.".to_string(),
                context: Some(error_logs.trim().to_string()),
            }]);
        }

        debug!(count = fixes.len(), "parsed structured diagnostics");
        Ok(fixes)
    }
}
