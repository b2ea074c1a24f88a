use crate::dispatch::ChatMessage;

/// Token counting capability, used only when a provider stream ends
/// without a usage event.
pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, text: &str) -> u32;

    /// Estimate for a chat transcript: content plus a small per-message
    /// framing overhead.
    fn count_messages(&self, model: &str, messages: &[ChatMessage]) -> u32 {
        messages
            .iter()
            .map(|m| self.count(model, &m.content) + 4)
            .sum()
    }
}

/// ~4 bytes per token. Wrong for CJK and code, but accounting here feeds
/// approximate cost, not billing.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, _model: &str, text: &str) -> u32 {
        (text.len() as u32).div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let c = HeuristicTokenCounter;
        assert_eq!(c.count("any", ""), 0);
        assert_eq!(c.count("any", "ab"), 1);
        assert_eq!(c.count("any", "abcd"), 1);
        assert_eq!(c.count("any", "abcde"), 2);
    }

    #[test]
    fn messages_add_framing_overhead() {
        let c = HeuristicTokenCounter;
        let msgs = vec![
            ChatMessage::user("hello there"),
            ChatMessage::system("be brief"),
        ];
        assert_eq!(c.count_messages("any", &msgs), 3 + 4 + 2 + 4);
    }
}
