//! OpenRouter-backed `ChatCompletionClient` (spec §1 names the concrete LLM
//! HTTP client out of scope for *behavioural depth*, but the CLI entrypoint
//! still needs a real implementation of the seam to drive an actual chat
//! turn). Wire format and streaming shape follow
//! `examples/original_source/examples/PyBasic/chat.py`'s OpenAI client
//! usage one-for-one: POST `chat/completions` with `stream: true`, parse
//! `text/event-stream` chunks, reassemble `delta.content`/`delta.tool_calls`.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::stream::{ChatCompletionClient, EventStream, StreamEvent, ToolCallDelta};
use super::types::{Message, ToolDef};
use crate::error::BackendError;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self { http: reqwest::Client::new(), api_key, model }
    }
}

#[async_trait]
impl ChatCompletionClient for OpenRouterClient {
    async fn stream_completion(
        &self,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<EventStream, BackendError> {
        let messages = serde_json::to_value(history)
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;
        let tools_json = tools_to_openai(tools);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(tools_json) = tools_json {
            body["tools"] = tools_json;
        }

        let response = self
            .http
            .post(OPENROUTER_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::ExecFailed { code: None, stderr: e.to_string() })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::ExecFailed {
                code: status.as_u16().into(),
                stderr: text,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel::<Result<StreamEvent, BackendError>>();
        tokio::spawn(pump_sse(response.bytes_stream(), tx));

        let stream: EventStream = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));
        Ok(stream)
    }
}

fn tools_to_openai(tools: &[ToolDef]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }
    Some(Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect(),
    ))
}

/// Reads the response body as newline-delimited SSE frames (`data: {...}`),
/// forwarding each parsed delta until `data: [DONE]` or the stream ends.
async fn pump_sse(
    mut bytes: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    tx: mpsc::UnboundedSender<Result<StreamEvent, BackendError>>,
) {
    let mut buffer = String::new();
    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(BackendError::ExecFailed { code: None, stderr: e.to_string() }));
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);
            if !dispatch_event(&event, &tx) {
                return;
            }
        }
    }
}

/// Returns `false` once `[DONE]` is seen or a frame fails to parse as an
/// event the caller should keep listening past.
fn dispatch_event(event: &str, tx: &mpsc::UnboundedSender<Result<StreamEvent, BackendError>>) -> bool {
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            return false;
        }
        let parsed: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        for ev in delta_events(&parsed) {
            if tx.send(Ok(ev)).is_err() {
                return false;
            }
        }
    }
    true
}

fn delta_events(chunk: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let Some(delta) = chunk.pointer("/choices/0/delta") else {
        return events;
    };
    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        events.push(StreamEvent::Content(content.to_string()));
    }
    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in tool_calls {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let id = tc.get("id").and_then(Value::as_str).map(str::to_string);
            let function = tc.get("function");
            let function_name =
                function.and_then(|f| f.get("name")).and_then(Value::as_str).map(str::to_string);
            let arguments_fragment = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .map(str::to_string);
            events.push(StreamEvent::ToolCall(ToolCallDelta {
                index,
                id,
                function_name,
                arguments_fragment,
            }));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_events_extracts_content() {
        let chunk = json!({"choices": [{"delta": {"content": "hi"}}]});
        let events = delta_events(&chunk);
        assert!(matches!(&events[0], StreamEvent::Content(c) if c == "hi"));
    }

    #[test]
    fn delta_events_extracts_tool_call_fragment() {
        let chunk = json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call-1",
                        "function": {"name": "readdir", "arguments": "{\"path\""},
                    }]
                }
            }]
        });
        let events = delta_events(&chunk);
        match &events[0] {
            StreamEvent::ToolCall(delta) => {
                assert_eq!(delta.index, 0);
                assert_eq!(delta.id.as_deref(), Some("call-1"));
                assert_eq!(delta.function_name.as_deref(), Some("readdir"));
                assert_eq!(delta.arguments_fragment.as_deref(), Some("{\"path\""));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn tools_to_openai_wraps_in_function_type() {
        let tools = vec![ToolDef {
            name: "readdir".to_string(),
            description: Some("list files".to_string()),
            input_schema: json!({"type": "object"}),
        }];
        let wrapped = tools_to_openai(&tools).unwrap();
        assert_eq!(wrapped[0]["type"], "function");
        assert_eq!(wrapped[0]["function"]["name"], "readdir");
    }

    #[test]
    fn tools_to_openai_empty_list_is_none() {
        assert!(tools_to_openai(&[]).is_none());
    }
}
