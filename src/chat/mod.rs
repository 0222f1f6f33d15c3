//! The agentic chat loop (C10): streaming reassembly, rendering, and the
//! bounded tool-use turn.

pub mod loop_;
pub mod openrouter;
pub mod render;
pub mod stream;
pub mod types;

pub use loop_::{run_chat_loop, run_inner_turn, ToolInvoker};
pub use openrouter::OpenRouterClient;
pub use render::{PlainRenderer, Renderer};
pub use stream::{ChatCompletionClient, DeltaAssembler, EventStream, StreamEvent, ToolCallDelta};
pub use types::{Message, ToolCall, ToolCallFunction, ToolCallKind, ToolDef};
