//! Remediation orchestration primitives.
//!
//! The orchestrator exposes one iteration's worth of work — analyze
//! build output, exchange fixes with the agent, surface the proposed
//! content — and deliberately holds no iteration counter. Bounding the
//! loop is the external driver's responsibility, backed by
//! configuration. Collaborator failures propagate unchanged; only
//! degenerate-input checks are handled locally.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agents::conversation::ConversationManager;
use crate::agents::lifecycle::AgentManager;
use crate::analysis::ErrorAnalysis;
use crate::error::{Error, Result};
use crate::prompts::{Fix, FixPromptFormatter};
use crate::spec_files::SpecFileStore;

/// One file replacement proposed by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
}

/// Coordinates the five collaborators of a remediation session.
pub struct FixOrchestrator {
    analysis: Arc<dyn ErrorAnalysis>,
    file_store: Arc<SpecFileStore>,
    conversation: ConversationManager,
    agent_manager: Arc<AgentManager>,
    formatter: FixPromptFormatter,
    initialized: bool,
}

impl FixOrchestrator {
    pub fn new(
        analysis: Arc<dyn ErrorAnalysis>,
        file_store: Arc<SpecFileStore>,
        conversation: ConversationManager,
        agent_manager: Arc<AgentManager>,
        formatter: FixPromptFormatter,
    ) -> Self {
        Self {
            analysis,
            file_store,
            conversation,
            agent_manager,
            formatter,
            initialized: false,
        }
    }

    /// One-time per-session setup: verify the agent has spec files to
    /// search, create the remote agent, and start the backing
    /// conversation. Subsequent calls are a no-op.
    pub async fn initialize_environment(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.initialized {
            debug!("environment already initialized, skipping");
            return Ok(());
        }

        let spec_files = self.file_store.list_files()?;
        if spec_files.is_empty() {
            return Err(Error::validation(
                "spec_files",
                "no spec files available for the agent to search",
            ));
        }
        debug!(count = spec_files.len(), "spec files prepared for the session");

        let agent = self.agent_manager.get_or_create_agent(cancel).await?.clone();
        self.conversation.set_agent(agent.id);
        self.conversation.start_conversation(cancel).await?;
        self.initialized = true;
        info!("remediation environment initialized");
        Ok(())
    }

    /// Delegate build output to the analysis capability. Empty output
    /// analyzes to no fixes.
    pub async fn analyze_errors(
        &self,
        error_logs: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fix>> {
        self.analysis.analyze(error_logs, cancel).await
    }

    /// Convert the fixes into one exchange with the agent and return its
    /// proposed replacement content. A single fix gets a targeted
    /// prompt; several get a batched prompt with category headers.
    pub async fn fix_code(
        &mut self,
        fixes: &[Fix],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let prompt = self.formatter.format(fixes)?;
        info!(fixes = fixes.len(), "sending fix prompt to agent");
        self.conversation.send_message(&prompt, cancel).await
    }

    /// Write agent-proposed file updates back through the confined
    /// store.
    pub async fn apply_updates(
        &self,
        updates: &[FileUpdate],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        for update in updates {
            self.file_store
                .update_file(&update.path, &update.content)
                .await?;
        }
        Ok(())
    }

    /// Idempotent teardown of the thread and agent.
    pub async fn shutdown(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.conversation.delete_thread(cancel).await?;
        self.agent_manager.delete_agent(cancel).await?;
        Ok(())
    }
}

/// Extract `### FILE: <path>` sections with fenced content from an agent
/// reply. Replies with no recognizable sections yield no updates — the
/// driver decides whether that ends the iteration.
pub fn parse_file_updates(reply: &str) -> Vec<FileUpdate> {
    let mut updates = Vec::new();
    let mut lines = reply.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(path) = line.trim().strip_prefix("### FILE:").map(str::trim) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        // Skip to the opening fence.
        for fence_candidate in lines.by_ref() {
            if fence_candidate.trim_start().starts_with("```") {
                break;
            }
        }
        let mut content = String::new();
        for body_line in lines.by_ref() {
            if body_line.trim_start().starts_with("```") {
                break;
            }
            content.push_str(body_line);
            content.push('\n');
        }
        updates.push(FileUpdate {
            path: path.to_string(),
            content,
        });
    }
    updates
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::agents::client::AgentConfig;
    use crate::agents::testing::MockAgentsClient;
    use crate::analysis::LogPatternAnalyzer;
    use crate::tools::ToolDispatcher;
    use crate::validation::validate_and_create;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _spec: TempDir,
        _out: TempDir,
        client: Arc<MockAgentsClient>,
        orchestrator: FixOrchestrator,
    }

    fn fixture() -> Fixture {
        let spec = TempDir::new().unwrap();
        std::fs::write(spec.path().join("main.tsp"), "model Main {}").unwrap();
        let out = TempDir::new().unwrap();
        let ctx = validate_and_create(
            spec.path().to_str().unwrap(),
            "",
            out.path().to_str().unwrap(),
        )
        .unwrap();
        let store = Arc::new(SpecFileStore::for_local(&ctx).unwrap());
        let client = Arc::new(MockAgentsClient::new());
        let conversation = ConversationManager::new(
            client.clone(),
            ToolDispatcher::new(store.clone()),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        let agent_manager = Arc::new(AgentManager::new(
            client.clone(),
            AgentConfig {
                model: "gpt-4o".to_string(),
                name: "Spec Fix Agent".to_string(),
                instructions: "fix".to_string(),
            },
        ));
        let orchestrator = FixOrchestrator::new(
            Arc::new(LogPatternAnalyzer::new()),
            store,
            conversation,
            agent_manager,
            FixPromptFormatter::new("fix instructions"),
        );
        Fixture {
            _spec: spec,
            _out: out,
            client,
            orchestrator,
        }
    }

    fn rule_fix(rule: &str, message: &str) -> Fix {
        Fix::RuleViolation {
            rule: rule.to_string(),
            message: message.to_string(),
            edit: None,
        }
    }

    #[tokio::test]
    async fn initialize_creates_agent_and_thread_once() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();

        fx.orchestrator.initialize_environment(&cancel).await.unwrap();
        fx.orchestrator.initialize_environment(&cancel).await.unwrap();

        assert_eq!(fx.client.create_agent_calls(), 1);
        assert_eq!(fx.client.create_thread_calls(), 1);
    }

    #[tokio::test]
    async fn initialize_fails_without_spec_files() {
        let spec = TempDir::new().unwrap();
        std::fs::write(spec.path().join("only.tsp"), "model A {}").unwrap();
        let out = TempDir::new().unwrap();
        let ctx = validate_and_create(
            spec.path().to_str().unwrap(),
            "",
            out.path().to_str().unwrap(),
        )
        .unwrap();
        let store = Arc::new(SpecFileStore::for_local(&ctx).unwrap());
        // Remove the spec file after validation so the store is empty.
        std::fs::remove_file(spec.path().join("only.tsp")).unwrap();

        let client = Arc::new(MockAgentsClient::new());
        let mut orchestrator = FixOrchestrator::new(
            Arc::new(LogPatternAnalyzer::new()),
            store.clone(),
            ConversationManager::new(
                client.clone(),
                ToolDispatcher::new(store),
                Duration::from_millis(10),
                Duration::from_millis(500),
            ),
            Arc::new(AgentManager::new(
                client,
                AgentConfig {
                    model: "m".to_string(),
                    name: "n".to_string(),
                    instructions: "i".to_string(),
                },
            )),
            FixPromptFormatter::new("sys"),
        );

        let err = orchestrator
            .initialize_environment(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spec_files"));
    }

    #[tokio::test]
    async fn fix_code_before_initialize_is_a_state_error() {
        let mut fx = fixture();
        let err = fx
            .orchestrator
            .fix_code(&[rule_fix("GENERIC", "x")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conversation not started. Call start_conversation() first."
        );
    }

    #[tokio::test]
    async fn fix_code_rejects_empty_fix_list() {
        let mut fx = fixture();
        let err = fx
            .orchestrator
            .fix_code(&[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fixes"));
    }

    #[tokio::test]
    async fn fix_code_sends_formatted_prompt_and_returns_reply() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.orchestrator.initialize_environment(&cancel).await.unwrap();

        let reply = fx
            .orchestrator
            .fix_code(
                &[rule_fix("GENERIC", "first"), rule_fix("GENERIC", "second")],
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(reply, "agent reply");
        let posted = fx.client.posted_messages();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains("SYSTEM INSTRUCTIONS"));
        assert!(posted[0].contains("GENERIC (2 instances):"));
    }

    #[tokio::test]
    async fn analyze_errors_delegates_to_the_capability() {
        let fx = fixture();
        let fixes = fx
            .orchestrator
            .analyze_errors(
                "main.tsp:3:1 - error invalid-ref: Unknown identifier 'X'",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(fixes.len(), 1);

        let none = fx
            .orchestrator
            .analyze_errors("", &CancellationToken::new())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn apply_updates_writes_through_the_confined_store() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        fx.orchestrator
            .apply_updates(
                &[FileUpdate {
                    path: "main.tsp".to_string(),
                    content: "model Fixed {}\n".to_string(),
                }],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fx._spec.path().join("main.tsp")).unwrap(),
            "model Fixed {}\n"
        );

        let err = fx
            .orchestrator
            .apply_updates(
                &[FileUpdate {
                    path: "../escape.tsp".to_string(),
                    content: String::new(),
                }],
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("escapes the spec directory"));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.orchestrator.initialize_environment(&cancel).await.unwrap();

        fx.orchestrator.shutdown(&cancel).await.unwrap();
        fx.orchestrator.shutdown(&cancel).await.unwrap();

        assert_eq!(fx.client.delete_thread_calls(), 1);
        assert_eq!(fx.client.delete_agent_calls(), 1);
    }

    #[test]
    fn parse_file_updates_extracts_fenced_sections() {
        let reply = "\
Here are the corrected files.

### FILE: main.tsp
```tsp
model Main {
  name: string;
}
```

### FILE: models/shared.tsp
```
model Shared {}
```
";
        let updates = parse_file_updates(reply);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].path, "main.tsp");
        assert!(updates[0].content.contains("name: string;"));
        assert_eq!(updates[1].path, "models/shared.tsp");
        assert_eq!(updates[1].content, "model Shared {}\n");
    }

    #[test]
    fn parse_file_updates_with_no_sections_is_empty() {
        assert!(parse_file_updates("I could not fix this.").is_empty());
        assert!(parse_file_updates("").is_empty());
    }
}
