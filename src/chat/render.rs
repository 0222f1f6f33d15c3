//! The terminal display contract (spec §4.10 "Display").

/// Tool results longer than this are truncated on screen; the full text
/// still lands in the `tool` message appended to history.
const TOOL_RESULT_DISPLAY_LIMIT: usize = 200;

pub trait Renderer: Send + Sync {
    fn on_assistant_start(&self) {}
    fn on_assistant_text(&self, chunk: &str);
    fn on_tool_call(&self, name: &str, arguments_json: &str);
    fn on_tool_result(&self, result: &str);
}

/// Plain stdout renderer, grounded on the teacher's `claude_stream.rs`
/// incremental-print pattern.
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn on_assistant_text(&self, chunk: &str) {
        print!("{chunk}");
    }

    fn on_tool_call(&self, name: &str, arguments_json: &str) {
        println!("  [{name}] {}", truncate_display(arguments_json));
    }

    fn on_tool_result(&self, result: &str) {
        println!("  => {}", truncate_display(result));
    }
}

/// First `TOOL_RESULT_DISPLAY_LIMIT` characters plus an ellipsis when
/// `text` is longer (spec §8 Scenario E).
fn truncate_display(text: &str) -> String {
    if text.chars().count() <= TOOL_RESULT_DISPLAY_LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(TOOL_RESULT_DISPLAY_LIMIT).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_e_truncates_display_at_200_chars() {
        let text = "x".repeat(5000);
        let displayed = truncate_display(&text);
        assert_eq!(displayed.len(), 200 + 3);
        assert!(displayed.ends_with("..."));
    }

    #[test]
    fn short_text_is_not_truncated() {
        assert_eq!(truncate_display("short"), "short");
    }
}
