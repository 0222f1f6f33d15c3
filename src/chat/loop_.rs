//! The outer REPL and inner tool-use turn (spec §4.10).

use async_trait::async_trait;
use futures::StreamExt;

use super::render::Renderer;
use super::stream::{ChatCompletionClient, DeltaAssembler, StreamEvent};
use super::types::{Message, ToolDef};
use crate::error::BackendError;

/// Caps a single inner turn so a model stuck calling tools forever can't
/// spin the loop indefinitely (spec §4.10 step 3, §8 Scenario D).
const MAX_INNER_ITERATIONS: usize = 15;

/// Abstracts `McpSession::call_tool` so the loop can be tested without a
/// live MCP transport.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<String, BackendError>;
}

#[async_trait]
impl ToolInvoker for crate::mcp::McpSession {
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<String, BackendError> {
        crate::mcp::McpSession::call_tool(self, name, arguments).await
    }
}

/// Reads lines from `input` until EOF or an `"exit"` line, running one
/// inner turn per non-empty line.
pub async fn run_chat_loop<R, I, C>(
    mut input: impl tokio::io::AsyncBufRead + Unpin,
    history: &mut Vec<Message>,
    tools: &[ToolDef],
    completion_client: &C,
    invoker: &I,
    renderer: &R,
) -> Result<(), BackendError>
where
    R: Renderer,
    I: ToolInvoker,
    C: ChatCompletionClient,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = tokio::io::AsyncBufReadExt::read_line(&mut input, &mut line)
            .await
            .map_err(BackendError::Io)?;
        if bytes_read == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed == "exit" {
            return Ok(());
        }
        if trimmed.is_empty() {
            continue;
        }

        history.push(Message::User { content: trimmed.to_string() });
        run_inner_turn(history, tools, completion_client, invoker, renderer).await?;
    }
}

/// One user-turn's worth of assistant/tool exchanges, bounded at
/// `MAX_INNER_ITERATIONS`.
pub async fn run_inner_turn<R, I, C>(
    history: &mut Vec<Message>,
    tools: &[ToolDef],
    completion_client: &C,
    invoker: &I,
    renderer: &R,
) -> Result<(), BackendError>
where
    R: Renderer,
    I: ToolInvoker,
    C: ChatCompletionClient,
{
    for _ in 0..MAX_INNER_ITERATIONS {
        let mut stream = completion_client.stream_completion(history, tools).await?;
        let mut assembler = DeltaAssembler::new();
        let mut started = false;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Content(chunk) => {
                    if !started {
                        renderer.on_assistant_start();
                        started = true;
                    }
                    renderer.on_assistant_text(&chunk);
                    assembler.push_content(&chunk);
                }
                StreamEvent::ToolCall(delta) => assembler.push_tool_call_delta(delta),
            }
        }

        let (content, tool_calls) = assembler.finish();
        let has_tool_calls = !tool_calls.is_empty();
        history.push(Message::Assistant {
            content: content.clone(),
            tool_calls: if has_tool_calls { Some(tool_calls.clone()) } else { None },
        });

        if !has_tool_calls {
            return Ok(());
        }

        for call in &tool_calls {
            let arguments: serde_json::Value = if call.function.arguments.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
            };
            renderer.on_tool_call(&call.function.name, &call.function.arguments);
            let result = match invoker.call_tool(&call.function.name, arguments).await {
                Ok(text) => text,
                Err(e) => format!("error: {e}"),
            };
            renderer.on_tool_result(&result);
            history.push(Message::Tool { tool_call_id: call.id.clone(), content: result });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::stream;

    use super::*;
    use crate::chat::stream::ToolCallDelta;
    use crate::chat::types::{ToolCallFunction, ToolCallKind};

    struct RecordingRenderer {
        tool_calls: Mutex<Vec<(String, String)>>,
        tool_results: Mutex<Vec<String>>,
    }

    impl RecordingRenderer {
        fn new() -> Self {
            Self { tool_calls: Mutex::new(Vec::new()), tool_results: Mutex::new(Vec::new()) }
        }
    }

    impl Renderer for RecordingRenderer {
        fn on_assistant_text(&self, _chunk: &str) {}
        fn on_tool_call(&self, name: &str, arguments_json: &str) {
            self.tool_calls.lock().unwrap().push((name.to_string(), arguments_json.to_string()));
        }
        fn on_tool_result(&self, result: &str) {
            self.tool_results.lock().unwrap().push(result.to_string());
        }
    }

    struct AlwaysCallsToolClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatCompletionClient for AlwaysCallsToolClient {
        async fn stream_completion(
            &self,
            _history: &[Message],
            _tools: &[ToolDef],
        ) -> Result<super::super::stream::EventStream, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let events = vec![
                Ok(StreamEvent::ToolCall(ToolCallDelta {
                    index: 0,
                    id: Some("call-1".to_string()),
                    function_name: Some("noop".to_string()),
                    arguments_fragment: Some("{}".to_string()),
                })),
            ];
            let s: Pin<Box<dyn futures::Stream<Item = Result<StreamEvent, BackendError>> + Send>> =
                Box::pin(stream::iter(events));
            Ok(s)
        }
    }

    struct EchoInvoker {
        invocations: AtomicUsize,
        response: String,
    }

    #[async_trait]
    impl ToolInvoker for EchoInvoker {
        async fn call_tool(&self, _name: &str, _arguments: serde_json::Value) -> Result<String, BackendError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn scenario_d_inner_turn_stops_after_max_iterations() {
        let client = AlwaysCallsToolClient { calls: AtomicUsize::new(0) };
        let invoker = EchoInvoker { invocations: AtomicUsize::new(0), response: "ok".to_string() };
        let renderer = RecordingRenderer::new();
        let mut history = vec![Message::User { content: "go".to_string() }];

        run_inner_turn(&mut history, &[], &client, &invoker, &renderer).await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), MAX_INNER_ITERATIONS);
        assert_eq!(invoker.invocations.load(Ordering::SeqCst), MAX_INNER_ITERATIONS);
    }

    struct OneShotToolThenTextClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatCompletionClient for OneShotToolThenTextClient {
        async fn stream_completion(
            &self,
            _history: &[Message],
            _tools: &[ToolDef],
        ) -> Result<super::super::stream::EventStream, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let events: Vec<Result<StreamEvent, BackendError>> = if n == 0 {
                vec![Ok(StreamEvent::ToolCall(ToolCallDelta {
                    index: 0,
                    id: Some("call-1".to_string()),
                    function_name: Some("dump".to_string()),
                    arguments_fragment: Some("{}".to_string()),
                }))]
            } else {
                vec![Ok(StreamEvent::Content("done".to_string()))]
            };
            let s: Pin<Box<dyn futures::Stream<Item = Result<StreamEvent, BackendError>> + Send>> =
                Box::pin(stream::iter(events));
            Ok(s)
        }
    }

    #[tokio::test]
    async fn scenario_e_full_tool_result_reaches_renderer_and_history_untruncated() {
        // The loop never truncates; `PlainRenderer::on_tool_result` is what
        // clips the on-screen copy (see render.rs), so both sinks here see
        // the full 5000-character text passed through unmodified.
        let long_result = "y".repeat(5000);
        let client = OneShotToolThenTextClient { calls: AtomicUsize::new(0) };
        let invoker = EchoInvoker { invocations: AtomicUsize::new(0), response: long_result.clone() };
        let renderer = RecordingRenderer::new();
        let mut history = vec![Message::User { content: "go".to_string() }];

        run_inner_turn(&mut history, &[], &client, &invoker, &renderer).await.unwrap();

        let displayed = renderer.tool_results.lock().unwrap();
        assert_eq!(displayed.len(), 1);
        assert_eq!(displayed[0], long_result);

        let stored_tool_message = history.iter().find_map(|m| match m {
            Message::Tool { content, .. } => Some(content.clone()),
            _ => None,
        });
        assert_eq!(stored_tool_message, Some(long_result));
    }

    struct TextOnlyClient;

    #[async_trait]
    impl ChatCompletionClient for TextOnlyClient {
        async fn stream_completion(
            &self,
            _history: &[Message],
            _tools: &[ToolDef],
        ) -> Result<super::super::stream::EventStream, BackendError> {
            let events: Vec<Result<StreamEvent, BackendError>> =
                vec![Ok(StreamEvent::Content("hi there".to_string()))];
            let s: Pin<Box<dyn futures::Stream<Item = Result<StreamEvent, BackendError>> + Send>> =
                Box::pin(stream::iter(events));
            Ok(s)
        }
    }

    #[tokio::test]
    async fn outer_loop_skips_blank_lines_and_stops_on_exit() {
        let client = TextOnlyClient;
        let invoker = EchoInvoker { invocations: AtomicUsize::new(0), response: String::new() };
        let renderer = RecordingRenderer::new();
        let mut history = Vec::new();
        let input = tokio::io::BufReader::new("\nhello\nexit\nshould not run\n".as_bytes());

        run_chat_loop(input, &mut history, &[], &client, &invoker, &renderer).await.unwrap();

        let user_turns = history.iter().filter(|m| matches!(m, Message::User { .. })).count();
        assert_eq!(user_turns, 1);
        assert_eq!(invoker.invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tool_call_kind_serializes_as_function() {
        let call = super::super::types::ToolCall {
            id: "x".to_string(),
            kind: ToolCallKind::Function,
            function: ToolCallFunction { name: "n".to_string(), arguments: "{}".to_string() },
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
    }
}
