//! Wire surface of the remote agents service.
//!
//! [`AgentsClient`] is the trait the rest of the crate programs against;
//! [`HttpAgentsClient`] speaks the assistants-style REST dialect the
//! service exposes (agents, threads, messages, runs, tool outputs).
//! Every call is cancellation-aware and authenticated with a bearer
//! token from the selected [`TokenCredential`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::TokenCredential;
use crate::error::{Error, Result};
use crate::tools::ToolName;
use crate::util::or_cancel;

/// Configuration for creating the remote agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub name: String,
    pub instructions: String,
}

/// Handle to a created remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentHandle {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadHandle {
    pub id: String,
}

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
        }
    }
}

/// One execution turn of the agent against a thread.
#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequiredAction {
    pub submit_tool_outputs: SubmitToolOutputs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<ToolCallRequest>,
}

/// A tool call the agent asked for, exactly as received off the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON string; parsed (and distrusted) by the dispatcher.
    pub arguments: String,
}

/// Output of one dispatched tool call, keyed back to the request.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Remote agents service operations.
#[async_trait]
pub trait AgentsClient: Send + Sync {
    async fn create_agent(
        &self,
        config: &AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<AgentHandle>;
    async fn delete_agent(&self, agent_id: &str, cancel: &CancellationToken) -> Result<()>;
    /// Attach a file-search vector store to an existing agent.
    async fn attach_vector_store(
        &self,
        agent_id: &str,
        store_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn create_thread(&self, cancel: &CancellationToken) -> Result<ThreadHandle>;
    async fn delete_thread(&self, thread_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn post_message(
        &self,
        thread_id: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn create_run(
        &self,
        thread_id: &str,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Run>;
    async fn get_run(
        &self,
        thread_id: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Run>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
        cancel: &CancellationToken,
    ) -> Result<Run>;

    /// Newest assistant message in the thread, if any.
    async fn latest_assistant_message(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;
}

/// `reqwest`-backed implementation of [`AgentsClient`].
pub struct HttpAgentsClient {
    endpoint: String,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
    http: reqwest::Client,
}

impl std::fmt::Debug for HttpAgentsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentsClient")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("credential", &self.credential.name())
            .field("http", &self.http)
            .finish()
    }
}

impl HttpAgentsClient {
    pub fn new(
        endpoint: &str,
        api_version: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self> {
        if endpoint.trim().is_empty() {
            return Err(Error::validation(
                "agents_endpoint",
                "agents service endpoint is not configured",
            ));
        }
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            credential,
            http: reqwest::Client::new(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let token = self.credential.get_token(cancel).await?;
        let url = format!("{}/{path}", self.endpoint);
        debug!(%method, path, "agents service request");

        let mut request = self
            .http
            .request(method, &url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token.secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = or_cancel(request.send(), cancel).await??;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or(body);
            return Err(Error::Remote {
                status: status.as_u16(),
                message,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Function-tool definitions advertised at agent creation, derived
    /// from the fixed registry so the wire schema cannot drift from the
    /// dispatcher.
    fn tool_definitions() -> Value {
        let tools: Vec<Value> = ToolName::ALL
            .iter()
            .map(|tool| match tool {
                ToolName::ListSpecFiles => json!({
                    "type": "function",
                    "function": {
                        "name": tool.wire_name(),
                        "description": "List the spec files available in this session.",
                        "parameters": {"type": "object", "properties": {}},
                    },
                }),
                ToolName::GetSpecFile => json!({
                    "type": "function",
                    "function": {
                        "name": tool.wire_name(),
                        "description": "Retrieve the content of one spec file.",
                        "parameters": {
                            "type": "object",
                            "properties": {
                                "path": {"type": "string", "description": "Relative path of the spec file."},
                            },
                            "required": ["path"],
                        },
                    },
                }),
            })
            .collect();
        Value::Array(tools)
    }
}

#[async_trait]
impl AgentsClient for HttpAgentsClient {
    async fn create_agent(
        &self,
        config: &AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<AgentHandle> {
        let body = json!({
            "model": config.model,
            "name": config.name,
            "instructions": config.instructions,
            "tools": Self::tool_definitions(),
        });
        let value = self
            .request(Method::POST, "assistants", Some(body), cancel)
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn delete_agent(&self, agent_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("assistants/{agent_id}"),
            None,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn attach_vector_store(
        &self,
        agent_id: &str,
        store_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = json!({
            "tool_resources": {
                "file_search": {"vector_store_ids": [store_id]},
            },
        });
        self.request(
            Method::POST,
            &format!("assistants/{agent_id}"),
            Some(body),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn create_thread(&self, cancel: &CancellationToken) -> Result<ThreadHandle> {
        let value = self
            .request(Method::POST, "threads", Some(json!({})), cancel)
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn delete_thread(&self, thread_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("threads/{thread_id}"),
            None,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn post_message(
        &self,
        thread_id: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = json!({"role": "user", "content": content});
        self.request(
            Method::POST,
            &format!("threads/{thread_id}/messages"),
            Some(body),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn create_run(
        &self,
        thread_id: &str,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Run> {
        let body = json!({"assistant_id": agent_id});
        let value = self
            .request(
                Method::POST,
                &format!("threads/{thread_id}/runs"),
                Some(body),
                cancel,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn get_run(
        &self,
        thread_id: &str,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Run> {
        let value = self
            .request(
                Method::GET,
                &format!("threads/{thread_id}/runs/{run_id}"),
                None,
                cancel,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
        cancel: &CancellationToken,
    ) -> Result<Run> {
        let body = json!({
            "tool_outputs": outputs
                .iter()
                .map(|o| json!({"tool_call_id": o.tool_call_id, "output": o.output}))
                .collect::<Vec<_>>(),
        });
        let value = self
            .request(
                Method::POST,
                &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
                Some(body),
                cancel,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn latest_assistant_message(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct MessageList {
            data: Vec<MessageItem>,
        }
        #[derive(Deserialize)]
        struct MessageItem {
            role: String,
            #[serde(default)]
            content: Vec<MessageContent>,
        }
        #[derive(Deserialize)]
        struct MessageContent {
            #[serde(default)]
            text: Option<MessageText>,
        }
        #[derive(Deserialize)]
        struct MessageText {
            value: String,
        }

        let value = self
            .request(
                Method::GET,
                &format!("threads/{thread_id}/messages?order=desc&limit=10"),
                None,
                cancel,
            )
            .await?;
        let list: MessageList =
            serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))?;

        Ok(list.data.into_iter().find(|m| m.role == "assistant").map(
            |message| {
                message
                    .content
                    .into_iter()
                    .filter_map(|c| c.text.map(|t| t.value))
                    .collect::<Vec<_>>()
                    .join("\n")
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::auth::{AccessToken, TokenCredential};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedCredential;

    #[async_trait]
    impl TokenCredential for FixedCredential {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn get_token(&self, _cancel: &CancellationToken) -> Result<AccessToken> {
            Ok(AccessToken::new("test-token", None))
        }
    }

    fn client(uri: &str) -> HttpAgentsClient {
        HttpAgentsClient::new(uri, "2024-12-01", Arc::new(FixedCredential)).unwrap()
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let err = HttpAgentsClient::new("", "v1", Arc::new(FixedCredential)).unwrap_err();
        assert!(err.to_string().contains("agents_endpoint"));
    }

    #[tokio::test]
    async fn create_agent_posts_config_and_tools() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/assistants"))
            .and(query_param("api-version", "2024-12-01"))
            .and(bearer_token("test-token"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o",
                "name": "Spec Fix Agent",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "agent-1",
                "name": "Spec Fix Agent",
            })))
            .mount(&server)
            .await;

        let agent = client(&server.uri())
            .create_agent(
                &AgentConfig {
                    model: "gpt-4o".to_string(),
                    name: "Spec Fix Agent".to_string(),
                    instructions: "fix things".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(agent.id, "agent-1");
    }

    #[tokio::test]
    async fn service_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "rate limited"},
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .create_thread(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Remote { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limited");
            }
            other => panic!("expected remote error, got {other}"),
        }
    }

    #[tokio::test]
    async fn run_status_deserializes_from_wire_names() {
        let run: Run = serde_json::from_value(serde_json::json!({
            "id": "run-1",
            "status": "requires_action",
            "required_action": {
                "submit_tool_outputs": {
                    "tool_calls": [{
                        "id": "call-1",
                        "function": {"name": "get_spec_file", "arguments": "{\"path\":\"a.tsp\"}"},
                    }],
                },
            },
        }))
        .unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction);
        let action = run.required_action.unwrap();
        assert_eq!(action.submit_tool_outputs.tool_calls[0].function.name, "get_spec_file");
        assert!(!run.status.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
    }

    #[tokio::test]
    async fn latest_assistant_message_skips_user_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"role": "user", "content": [{"text": {"value": "please fix"}}]},
                    {"role": "assistant", "content": [{"text": {"value": "fixed content"}}]},
                ],
            })))
            .mount(&server)
            .await;

        let message = client(&server.uri())
            .latest_assistant_message("thread-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(message.as_deref(), Some("fixed content"));
    }

    #[tokio::test]
    async fn cancellation_propagates_out_of_requests() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client(&server.uri())
            .create_thread(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
