//! Scriptable in-memory [`AgentsClient`] for tests.
//!
//! Counts every call and replays a queued sequence of run states, so
//! lifecycle and conversation tests can exercise polling, tool-call
//! rounds, and teardown without a network.

// Mutex poisoning cannot happen in these single-purpose fixtures.
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agents::client::{
    AgentConfig, AgentHandle, AgentsClient, FunctionCall, RequiredAction, Run, RunStatus,
    SubmitToolOutputs, ThreadHandle, ToolCallRequest, ToolOutput,
};
use crate::error::Result;

#[derive(Default)]
pub struct MockAgentsClient {
    create_agent_calls: AtomicUsize,
    delete_agent_calls: AtomicUsize,
    attach_vector_store_calls: AtomicUsize,
    create_thread_calls: AtomicUsize,
    delete_thread_calls: AtomicUsize,
    run_script: Mutex<VecDeque<Run>>,
    posted_messages: Mutex<Vec<String>>,
    submitted_outputs: Mutex<Vec<Vec<ToolOutput>>>,
    reply: Mutex<Option<String>>,
}

impl MockAgentsClient {
    pub fn new() -> Self {
        Self {
            reply: Mutex::new(Some("agent reply".to_string())),
            ..Self::default()
        }
    }

    /// Queue the next run state returned by `create_run`, `get_run`, or
    /// `submit_tool_outputs`. When the queue is empty a completed run is
    /// returned.
    pub fn queue_run(&self, run: Run) {
        self.run_script.lock().unwrap().push_back(run);
    }

    pub fn set_reply(&self, reply: Option<&str>) {
        *self.reply.lock().unwrap() = reply.map(str::to_string);
    }

    /// A run in the given status with no pending action.
    pub fn run(status: RunStatus) -> Run {
        Run {
            id: "run-1".to_string(),
            status,
            required_action: None,
        }
    }

    /// A run waiting on the given `(call_id, tool_name, arguments)` calls.
    pub fn run_requiring(calls: &[(&str, &str, &str)]) -> Run {
        Run {
            id: "run-1".to_string(),
            status: RunStatus::RequiresAction,
            required_action: Some(RequiredAction {
                submit_tool_outputs: SubmitToolOutputs {
                    tool_calls: calls
                        .iter()
                        .map(|(id, name, arguments)| ToolCallRequest {
                            id: (*id).to_string(),
                            function: FunctionCall {
                                name: (*name).to_string(),
                                arguments: (*arguments).to_string(),
                            },
                        })
                        .collect(),
                },
            }),
        }
    }

    fn next_run(&self) -> Run {
        self.run_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::run(RunStatus::Completed))
    }

    pub fn create_agent_calls(&self) -> usize {
        self.create_agent_calls.load(Ordering::SeqCst)
    }

    pub fn delete_agent_calls(&self) -> usize {
        self.delete_agent_calls.load(Ordering::SeqCst)
    }

    pub fn attach_vector_store_calls(&self) -> usize {
        self.attach_vector_store_calls.load(Ordering::SeqCst)
    }

    pub fn create_thread_calls(&self) -> usize {
        self.create_thread_calls.load(Ordering::SeqCst)
    }

    pub fn delete_thread_calls(&self) -> usize {
        self.delete_thread_calls.load(Ordering::SeqCst)
    }

    pub fn posted_messages(&self) -> Vec<String> {
        self.posted_messages.lock().unwrap().clone()
    }

    pub fn submitted_outputs(&self) -> Vec<Vec<ToolOutput>> {
        self.submitted_outputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentsClient for MockAgentsClient {
    async fn create_agent(
        &self,
        config: &AgentConfig,
        _cancel: &CancellationToken,
    ) -> Result<AgentHandle> {
        // Yield so concurrent first-access tests actually interleave.
        tokio::task::yield_now().await;
        self.create_agent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentHandle {
            id: "agent-1".to_string(),
            name: config.name.clone(),
        })
    }

    async fn delete_agent(&self, _agent_id: &str, _cancel: &CancellationToken) -> Result<()> {
        self.delete_agent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_vector_store(
        &self,
        _agent_id: &str,
        _store_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.attach_vector_store_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_thread(&self, _cancel: &CancellationToken) -> Result<ThreadHandle> {
        self.create_thread_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadHandle {
            id: "thread-1".to_string(),
        })
    }

    async fn delete_thread(&self, _thread_id: &str, _cancel: &CancellationToken) -> Result<()> {
        self.delete_thread_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn post_message(
        &self,
        _thread_id: &str,
        content: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.posted_messages.lock().unwrap().push(content.to_string());
        Ok(())
    }

    async fn create_run(
        &self,
        _thread_id: &str,
        _agent_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Run> {
        Ok(self.next_run())
    }

    async fn get_run(
        &self,
        _thread_id: &str,
        _run_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Run> {
        Ok(self.next_run())
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &str,
        _run_id: &str,
        outputs: &[ToolOutput],
        _cancel: &CancellationToken,
    ) -> Result<Run> {
        self.submitted_outputs.lock().unwrap().push(outputs.to_vec());
        Ok(self.next_run())
    }

    async fn latest_assistant_message(
        &self,
        _thread_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        Ok(self.reply.lock().unwrap().clone())
    }
}
