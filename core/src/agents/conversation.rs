//! Conversation state machine and run polling.
//!
//! State moves `NoAgentId → AgentIdSet → ThreadActive → (messages)* →
//! NoThread`. Each transition enforces its precondition as a
//! state-contract error — never a silent fallback. The manager owns one
//! session's state and is not safe for concurrent writers; callers
//! serialize transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::client::{AgentsClient, Run, RunStatus, ToolOutput};
use crate::error::{Error, Result};
use crate::tools::ToolDispatcher;
use crate::util::sleep_or_cancel;

/// Per-session conversation state. Owned exclusively by one
/// orchestration session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConversationState {
    agent_id: Option<String>,
    thread_id: Option<String>,
}

pub struct ConversationManager {
    client: Arc<dyn AgentsClient>,
    dispatcher: ToolDispatcher,
    poll_interval: Duration,
    max_wait: Duration,
    state: ConversationState,
}

impl ConversationManager {
    pub fn new(
        client: Arc<dyn AgentsClient>,
        dispatcher: ToolDispatcher,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            client,
            dispatcher,
            poll_interval,
            max_wait,
            state: ConversationState::default(),
        }
    }

    /// Bind the conversation to an agent. Must happen before
    /// [`ConversationManager::start_conversation`].
    pub fn set_agent(&mut self, agent_id: impl Into<String>) {
        self.state.agent_id = Some(agent_id.into());
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.state.thread_id.as_deref()
    }

    /// Create the conversation thread, or reuse the active one.
    pub async fn start_conversation(&mut self, cancel: &CancellationToken) -> Result<String> {
        if self.state.agent_id.is_none() {
            return Err(Error::State(
                "Agent id not set. Call set_agent() first.".to_string(),
            ));
        }
        if let Some(thread_id) = &self.state.thread_id {
            debug!(thread_id, "reusing active conversation thread");
            return Ok(thread_id.clone());
        }

        let thread = self.client.create_thread(cancel).await?;
        info!(thread_id = %thread.id, "conversation started");
        self.state.thread_id = Some(thread.id.clone());
        Ok(thread.id)
    }

    /// Send one message and drive the resulting run to completion,
    /// dispatching any tool calls the agent issues along the way.
    /// Returns the agent's reply.
    pub async fn send_message(
        &mut self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let (Some(agent_id), Some(thread_id)) = (
            self.state.agent_id.clone(),
            self.state.thread_id.clone(),
        ) else {
            return Err(Error::State(
                "Conversation not started. Call start_conversation() first.".to_string(),
            ));
        };

        self.client.post_message(&thread_id, content, cancel).await?;
        let run = self.client.create_run(&thread_id, &agent_id, cancel).await?;
        self.drive_run_to_completion(&thread_id, run, cancel).await?;

        match self
            .client
            .latest_assistant_message(&thread_id, cancel)
            .await?
        {
            Some(reply) => Ok(reply),
            None => Err(Error::Parse(
                "run completed but the thread has no assistant reply".to_string(),
            )),
        }
    }

    /// Delete the conversation thread. A missing thread is a logged
    /// no-op, mirroring the lazy/optional nature of the resource.
    pub async fn delete_thread(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(thread_id) = self.state.thread_id.take() else {
            debug!("no conversation thread to delete");
            return Ok(());
        };
        self.client.delete_thread(&thread_id, cancel).await?;
        info!(thread_id, "conversation thread deleted");
        Ok(())
    }

    /// Poll the run until it reaches a terminal state, answering tool
    /// calls as they appear. Bounded by the configured max wait; a run
    /// still pending at the deadline is a timeout failure, never a hang.
    async fn drive_run_to_completion(
        &self,
        thread_id: &str,
        mut run: Run,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;

        loop {
            match run.status {
                RunStatus::Completed => return Ok(()),
                RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired => {
                    warn!(run_id = %run.id, status = run.status.as_str(), "run ended abnormally");
                    return Err(Error::RunFailed {
                        run_id: run.id,
                        status: run.status.as_str().to_string(),
                    });
                }
                RunStatus::RequiresAction => {
                    let outputs = self.answer_tool_calls(&run, cancel).await?;
                    run = self
                        .client
                        .submit_tool_outputs(thread_id, &run.id, &outputs, cancel)
                        .await?;
                }
                RunStatus::Queued | RunStatus::InProgress => {
                    if Instant::now() >= deadline {
                        warn!(run_id = %run.id, "run polling deadline exceeded");
                        return Err(Error::RunTimeout {
                            run_id: run.id,
                            max_wait: self.max_wait,
                        });
                    }
                    sleep_or_cancel(self.poll_interval, cancel).await?;
                    run = self.client.get_run(thread_id, &run.id, cancel).await?;
                }
            }
        }
    }

    /// Dispatch every pending tool call through the sandboxed
    /// dispatcher. Malformed or unknown calls come back as error
    /// envelopes the agent can read; only cancellation aborts the round.
    async fn answer_tool_calls(
        &self,
        run: &Run,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolOutput>> {
        let calls = run
            .required_action
            .as_ref()
            .map(|action| action.submit_tool_outputs.tool_calls.as_slice())
            .unwrap_or_default();

        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            debug!(tool = %call.function.name, call_id = %call.id, "answering tool call");
            let output = self
                .dispatcher
                .execute_tool_call(&call.function.name, &call.function.arguments, cancel)
                .await?;
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::agents::testing::MockAgentsClient;
    use crate::spec_files::SpecFileStore;
    use crate::validation::validate_and_create;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        _spec: TempDir,
        _out: TempDir,
        client: Arc<MockAgentsClient>,
        manager: ConversationManager,
    }

    fn fixture() -> Fixture {
        let spec = TempDir::new().unwrap();
        std::fs::write(spec.path().join("test.tsp"), "model Test {}").unwrap();
        let out = TempDir::new().unwrap();
        let ctx = validate_and_create(
            spec.path().to_str().unwrap(),
            "",
            out.path().to_str().unwrap(),
        )
        .unwrap();
        let store = SpecFileStore::for_local(&ctx).unwrap();
        let client = Arc::new(MockAgentsClient::new());
        let manager = ConversationManager::new(
            client.clone(),
            ToolDispatcher::new(Arc::new(store)),
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        Fixture {
            _spec: spec,
            _out: out,
            client,
            manager,
        }
    }

    #[tokio::test]
    async fn send_before_start_fails_with_exact_state_message() {
        let mut fx = fixture();
        let err = fx
            .manager
            .send_message("hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conversation not started. Call start_conversation() first."
        );
    }

    #[tokio::test]
    async fn start_requires_agent_id() {
        let mut fx = fixture();
        let err = fx
            .manager
            .start_conversation(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Agent id not set. Call set_agent() first.");
    }

    #[tokio::test]
    async fn start_creates_thread_once_and_reuses_it() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");

        let first = fx.manager.start_conversation(&cancel).await.unwrap();
        let second = fx.manager.start_conversation(&cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.client.create_thread_calls(), 1);
    }

    #[tokio::test]
    async fn send_message_returns_agent_reply() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();

        let reply = fx.manager.send_message("fix it", &cancel).await.unwrap();

        assert_eq!(reply, "agent reply");
        assert_eq!(fx.client.posted_messages(), vec!["fix it".to_string()]);
    }

    #[tokio::test]
    async fn tool_calls_are_answered_and_outputs_submitted() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();

        fx.client.queue_run(MockAgentsClient::run_requiring(&[
            ("call-1", "list_spec_files", "{}"),
            ("call-2", "get_spec_file", r#"{"path":"test.tsp"}"#),
            ("call-3", "get_spec_file", "{}"),
        ]));
        // submit_tool_outputs pops the next run: completed.

        fx.manager.send_message("fix it", &cancel).await.unwrap();

        let rounds = fx.client.submitted_outputs();
        assert_eq!(rounds.len(), 1);
        let outputs = &rounds[0];
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].tool_call_id, "call-1");
        assert!(outputs[0].output.contains("test.tsp"));
        assert!(outputs[1].output.contains("model Test {}"));
        // The malformed third call comes back as an error envelope, not
        // a session failure.
        assert!(outputs[2].output.contains("Missing 'path' property"));
    }

    #[tokio::test]
    async fn pending_run_polls_until_completion() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();

        fx.client.queue_run(MockAgentsClient::run(RunStatus::Queued));
        fx.client.queue_run(MockAgentsClient::run(RunStatus::InProgress));
        fx.client.queue_run(MockAgentsClient::run(RunStatus::Completed));

        let reply = fx.manager.send_message("fix it", &cancel).await.unwrap();
        assert_eq!(reply, "agent reply");
    }

    #[tokio::test]
    async fn run_stuck_in_progress_times_out() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();

        // Far more pending states than the 200ms budget allows at a
        // 10ms poll interval.
        for _ in 0..100 {
            fx.client.queue_run(MockAgentsClient::run(RunStatus::InProgress));
        }

        let err = fx.manager.send_message("fix it", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::RunTimeout { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn failed_run_is_a_terminal_error() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();

        fx.client.queue_run(MockAgentsClient::run(RunStatus::Failed));

        let err = fx.manager.send_message("fix it", &cancel).await.unwrap_err();
        match err {
            Error::RunFailed { status, .. } => assert_eq!(status, "failed"),
            other => panic!("expected run failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn delete_thread_without_thread_is_a_noop() {
        let mut fx = fixture();
        fx.manager
            .delete_thread(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.client.delete_thread_calls(), 0);
    }

    #[tokio::test]
    async fn delete_thread_clears_state_and_is_idempotent() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();
        assert!(fx.manager.thread_id().is_some());

        fx.manager.delete_thread(&cancel).await.unwrap();
        assert!(fx.manager.thread_id().is_none());
        fx.manager.delete_thread(&cancel).await.unwrap();
        assert_eq!(fx.client.delete_thread_calls(), 1);

        // Messages fail again after the thread is gone.
        let err = fx.manager.send_message("more", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[tokio::test]
    async fn missing_assistant_reply_is_a_parse_error() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        fx.manager.set_agent("agent-1");
        fx.manager.start_conversation(&cancel).await.unwrap();
        fx.client.set_reply(None);

        let err = fx.manager.send_message("fix it", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
