//! Tool-call dispatch at the agent trust boundary.
//!
//! The remote agent issues tool calls as `{toolName, argumentsJson}`
//! pairs derived from free text. Nothing it sends may crash the session
//! or reach outside the sandbox: agent-attributable problems (unknown
//! tool, malformed JSON, missing fields, handler failures) are returned
//! to the conversation as an `{"error": "..."}` envelope so the agent
//! can self-correct. The only `Err` this dispatcher produces is
//! cancellation, which must surface to the caller rather than be folded
//! into the envelope.
//!
//! The registry is a closed enum: adding a tool is a compile-time
//! change, while unknown names stay a runtime-checked boundary exactly
//! where the agent's text enters the system.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::spec_files::SpecFileStore;
use crate::util::or_cancel;

/// The fixed tool registry. Wire names are matched case-sensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    /// Lists the spec files the agent may retrieve. No arguments.
    ListSpecFiles,
    /// Retrieves one spec file. Requires a string field `path`.
    GetSpecFile,
}

impl ToolName {
    pub const ALL: &[ToolName] = &[ToolName::ListSpecFiles, ToolName::GetSpecFile];

    pub fn wire_name(self) -> &'static str {
        match self {
            ToolName::ListSpecFiles => "list_spec_files",
            ToolName::GetSpecFile => "get_spec_file",
        }
    }

    /// Exact, case-sensitive lookup. Mismatched casing is unknown by
    /// design, forcing disciplined tool-call schemas on the agent side.
    fn from_wire(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tool| tool.wire_name() == name)
    }
}

/// Sandboxed operations behind the dispatcher. Implementations must
/// resolve any path argument only beneath the validated spec root —
/// the dispatcher performs no confinement of its own.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn list_spec_files(&self) -> Result<Vec<String>>;
    async fn get_spec_file(&self, path: &str) -> Result<String>;
}

#[async_trait]
impl ToolHandler for SpecFileStore {
    async fn list_spec_files(&self) -> Result<Vec<String>> {
        self.list_files()
    }

    async fn get_spec_file(&self, path: &str) -> Result<String> {
        self.read_file(path).await
    }
}

/// Routes agent-issued tool calls to a context-scoped handler.
///
/// Dispatch is stateless and safe for concurrent invocation; clones
/// share the underlying handler.
#[derive(Clone)]
pub struct ToolDispatcher {
    handler: Arc<dyn ToolHandler>,
}

impl ToolDispatcher {
    pub fn new(handler: Arc<dyn ToolHandler>) -> Self {
        Self { handler }
    }

    /// Execute one tool call and return the response JSON.
    ///
    /// Always returns `Ok` with either a success payload or an
    /// `{"error": "..."}` envelope — except for cancellation, which is
    /// honored at the first suspension point and surfaces as
    /// [`Error::Cancelled`].
    pub async fn execute_tool_call(
        &self,
        tool_name: &str,
        arguments_json: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if tool_name.trim().is_empty() {
            return Ok(error_envelope("Tool name cannot be null or empty"));
        }
        let Some(tool) = ToolName::from_wire(tool_name) else {
            warn!(tool_name, "agent requested unknown tool");
            return Ok(error_envelope(&format!("Unknown tool: {tool_name}")));
        };
        debug!(tool = tool.wire_name(), "dispatching tool call");

        match tool {
            ToolName::ListSpecFiles => {
                match or_cancel(self.handler.list_spec_files(), cancel).await? {
                    Ok(files) => Ok(success_payload(json!({
                        "count": files.len(),
                        "files": files,
                    }))),
                    Err(e) => Ok(error_envelope(&format!("Tool execution failed: {e}"))),
                }
            }
            ToolName::GetSpecFile => {
                let args: Value = match serde_json::from_str(arguments_json) {
                    Ok(args) => args,
                    Err(e) => {
                        return Ok(error_envelope(&format!("Tool execution failed: {e}")));
                    }
                };
                // Exact, case-sensitive field lookup: `Path` is missing.
                let path = match args.get("path").and_then(Value::as_str) {
                    None => return Ok(error_envelope("Missing 'path' property")),
                    Some(path) if path.trim().is_empty() => {
                        return Ok(error_envelope("Missing or empty 'path'"));
                    }
                    Some(path) => path,
                };

                match or_cancel(self.handler.get_spec_file(path), cancel).await? {
                    Ok(content) => Ok(success_payload(json!({
                        "path": path,
                        "content": content,
                    }))),
                    Err(e) => Ok(error_envelope(&format!("Tool execution failed: {e}"))),
                }
            }
        }
    }
}

fn success_payload(value: Value) -> String {
    value.to_string()
}

fn error_envelope(message: &str) -> String {
    json!({ "error": message }).to_string()
}
