//! Remote agent plumbing: transport, lifecycle, and conversation state.
//!
//! [`client`] is the wire surface (trait + HTTP implementation),
//! [`lifecycle`] owns lazy agent creation and idempotent teardown, and
//! [`conversation`] owns the thread state machine and run polling.

pub mod client;
pub mod conversation;
pub mod lifecycle;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{AgentConfig, AgentHandle, AgentsClient, HttpAgentsClient, Run, RunStatus};
pub use conversation::ConversationManager;
pub use lifecycle::AgentManager;
