//! Streaming-delta reassembly (spec §4.10 step b/c).
//!
//! Two accumulators — a running string for text content and a per-index map
//! for tool-call fragments — so interleaving between the two kinds never
//! corrupts either (spec §5 ordering guarantees).

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::types::{Message, ToolCall, ToolCallFunction, ToolCallKind, ToolDef};
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function_name: Option<String>,
    pub arguments_fragment: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Content(String),
    ToolCall(ToolCallDelta),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, BackendError>> + Send>>;

/// Opens a streaming chat completion. The opaque LLM HTTP client lives
/// outside the core (spec §1 scopes it out); this is the seam the chat loop
/// needs.
#[async_trait]
pub trait ChatCompletionClient: Send + Sync {
    async fn stream_completion(
        &self,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<EventStream, BackendError>;
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Default)]
pub struct DeltaAssembler {
    content: String,
    tool_calls: BTreeMap<usize, PendingToolCall>,
}

impl DeltaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_content(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }

    pub fn push_tool_call_delta(&mut self, delta: ToolCallDelta) {
        let entry = self.tool_calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            entry.id = Some(id);
        }
        if let Some(name) = delta.function_name {
            entry.name = Some(name);
        }
        if let Some(fragment) = delta.arguments_fragment {
            entry.arguments.push_str(&fragment);
        }
    }

    /// Flatten into the final `(content, tool_calls)` pair, tool calls in
    /// ascending-index order (spec §4.10 step c).
    pub fn finish(self) -> (Option<String>, Vec<ToolCall>) {
        let content = if self.content.is_empty() { None } else { Some(self.content) };
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|(_, pending)| ToolCall {
                id: pending.id.unwrap_or_default(),
                kind: ToolCallKind::Function,
                function: ToolCallFunction {
                    name: pending.name.unwrap_or_default(),
                    arguments: pending.arguments,
                },
            })
            .collect();
        (content, tool_calls)
    }
}
