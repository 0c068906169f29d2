//! Lazy creation and idempotent teardown of the remote agent.
//!
//! One remote agent handle exists per session. First access creates it
//! from configuration and caches it; the one-shot guard is a
//! [`OnceCell`], not an ad hoc nullable check, so repeated or concurrent
//! first access can never double-create. Deletion is guarded by an
//! atomic flag: the second call (and any call after disposal) is a
//! no-op, never an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agents::client::{AgentConfig, AgentHandle, AgentsClient};
use crate::error::{Error, Result};

pub struct AgentManager {
    client: Arc<dyn AgentsClient>,
    config: AgentConfig,
    agent: OnceCell<AgentHandle>,
    deleted: AtomicBool,
}

impl AgentManager {
    pub fn new(client: Arc<dyn AgentsClient>, config: AgentConfig) -> Self {
        Self {
            client,
            config,
            agent: OnceCell::new(),
            deleted: AtomicBool::new(false),
        }
    }

    /// The session's agent handle, creating the remote agent on first
    /// access. Every subsequent access returns the identical cached
    /// handle; concurrent first accesses are serialized by the cell.
    pub async fn get_or_create_agent(&self, cancel: &CancellationToken) -> Result<&AgentHandle> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(Error::State(
                "Agent manager is disposed; no new agent can be created.".to_string(),
            ));
        }
        self.agent
            .get_or_try_init(|| async {
                info!(
                    model = %self.config.model,
                    name = %self.config.name,
                    "creating remote agent"
                );
                self.client.create_agent(&self.config, cancel).await
            })
            .await
    }

    /// Agent id if the agent has been created.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent.get().map(|agent| agent.id.as_str())
    }

    /// Attach a file-search vector store to the session agent.
    ///
    /// Both ids are required before any network call: a missing store id
    /// is a validation failure and an uncreated agent is a state error.
    pub async fn update_vector_store(
        &self,
        store_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if store_id.trim().is_empty() {
            return Err(Error::validation("store_id", "vector store id cannot be empty"));
        }
        let Some(agent_id) = self.agent_id() else {
            return Err(Error::State(
                "Agent not created. Call get_or_create_agent() first.".to_string(),
            ));
        };
        self.client
            .attach_vector_store(agent_id, store_id, cancel)
            .await?;
        debug!(agent_id, store_id, "attached vector store to agent");
        Ok(())
    }

    /// Delete the remote agent if it was ever created.
    ///
    /// Idempotent: only the first call has an effect. Calling before the
    /// agent exists, or calling repeatedly, is a no-op.
    pub async fn delete_agent(&self, cancel: &CancellationToken) -> Result<()> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            debug!("agent already deleted, skipping");
            return Ok(());
        }
        match self.agent.get() {
            Some(agent) => {
                info!(agent_id = %agent.id, "deleting remote agent");
                self.client.delete_agent(&agent.id, cancel).await
            }
            None => {
                debug!("no agent was created, nothing to delete");
                Ok(())
            }
        }
    }
}
