//! MCP session adapter (spec §4.9): opens a transport, awaits
//! `initialize()` under a connection timeout, and exposes `call_tool`.
//!
//! Grounded on `other_examples/mcpmux-mcp-mux/.../transports.rs`'s
//! `McpSession` (stdio) and `other_examples/qbit-ai-qbit/.../client.rs`'s
//! `connect_http` (HTTP + header propagation), both built on `rmcp`'s
//! `ServiceExt::serve`/`RunningService` pair.

use std::time::Duration;

use rmcp::model::{CallToolRequestParams, ClientCapabilities, ClientInfo, Implementation, Tool};
use rmcp::service::RunningService;
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::transport::McpTransportDescriptor;
use crate::backend::remote::Closeable;
use crate::error::BackendError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct AgentClientHandler;

impl ClientHandler for AgentClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "agent-backend".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            meta: None,
        }
    }
}

type Client = RunningService<RoleClient, AgentClientHandler>;

/// An open MCP session. Owns the transport for its entire lifetime — the
/// `RunningService` holds the child process / HTTP client, so dropping this
/// value (or `close`ing it) is the only way the transport goes away.
pub struct McpSession {
    client: Mutex<Option<Client>>,
}

impl McpSession {
    pub async fn open(descriptor: &McpTransportDescriptor) -> Result<Self, BackendError> {
        Self::open_with_timeout(descriptor, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        descriptor: &McpTransportDescriptor,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        match tokio::time::timeout(connect_timeout, Self::open_inner(descriptor)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(connect_timeout)),
        }
    }

    async fn open_inner(descriptor: &McpTransportDescriptor) -> Result<Self, BackendError> {
        let handler = AgentClientHandler;
        let client = match descriptor {
            McpTransportDescriptor::Stdio { cmd, args } => {
                let mut command = Command::new(cmd);
                command.args(args);
                let transport = TokioChildProcess::new(command).map_err(|e| {
                    BackendError::ExecFailed { code: None, stderr: e.to_string() }
                })?;
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?
            }
            McpTransportDescriptor::Http { url, auth_token, root_dir, scope_path } => {
                let mut headers = reqwest::header::HeaderMap::new();
                insert_header(&mut headers, "X-Root-Dir", root_dir)?;
                if let Some(scope) = scope_path {
                    insert_header(&mut headers, "X-Scope-Path", scope)?;
                }
                let http_client = reqwest::Client::builder()
                    .default_headers(headers)
                    .build()
                    .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;

                let mut config = StreamableHttpClientTransportConfig::with_uri(format!("{url}/mcp"));
                if let Some(token) = auth_token {
                    config = config.auth_header(token.clone());
                }
                let transport = StreamableHttpClientTransport::with_client(http_client, config);
                handler
                    .serve(transport)
                    .await
                    .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?
            }
        };

        Ok(Self { client: Mutex::new(Some(client)) })
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, BackendError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(BackendError::ConnectionClosed)?;
        let result = client
            .peer()
            .list_tools(Default::default())
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, BackendError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(BackendError::ConnectionClosed)?;
        let args = arguments.as_object().cloned();
        let result = client
            .peer()
            .call_tool(CallToolRequestParams { name: name.to_string().into(), arguments: args, task: None, meta: None })
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        Ok(extract_text(&result))
    }
}

#[async_trait::async_trait]
impl Closeable for McpSession {
    async fn close(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.cancel().await;
        }
    }
}

fn insert_header(
    headers: &mut reqwest::header::HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), BackendError> {
    let value = reqwest::header::HeaderValue::from_str(value)
        .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
    headers.insert(name, value);
    Ok(())
}

/// Concatenate the `text` field of every content part; stringify parts that
/// don't carry one (spec §4.10 step e).
fn extract_text(result: &rmcp::model::CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|part| match &part.raw {
            rmcp::model::RawContent::Text(text) => text.text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_concatenates_text_parts() {
        let result = rmcp::model::CallToolResult {
            content: vec![
                rmcp::model::Content::text("hello ".to_string()),
                rmcp::model::Content::text("world".to_string()),
            ],
            is_error: Some(false),
            structured_content: None,
            meta: None,
        };
        assert_eq!(extract_text(&result), "hello world");
    }
}
