/// Static price table: (model prefix, prompt USD per 1M tokens, completion
/// USD per 1M tokens). Longest matching prefix wins so "gpt-5-mini" is not
/// priced as "gpt-5". Prices drift; treat every number as approximate.
const PRICES: &[(&str, f64, f64)] = &[
    ("gpt-5-mini", 0.25, 2.0),
    ("gpt-5", 1.25, 10.0),
    ("gpt-4o-mini", 0.15, 0.6),
    ("gpt-4o", 2.5, 10.0),
    ("text-embedding-3-small", 0.02, 0.0),
    ("text-embedding-3-large", 0.13, 0.0),
    ("grok-4-1-fast-reasoning", 0.2, 0.5),
    ("grok-4", 3.0, 15.0),
    ("deepseek-reasoner", 0.55, 2.19),
    ("deepseek-chat", 0.27, 1.1),
    ("mistral-large", 2.0, 6.0),
    ("moonshotai/kimi-k2.5", 0.6, 2.5),
    ("z-ai/glm-5", 0.6, 2.2),
    ("Qwen/", 0.9, 0.9),
];

/// Approximate USD cost for one call. Unknown models cost zero; pricing
/// gaps must never fail a request.
pub fn approx_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let Some((_, prompt_price, completion_price)) = PRICES
        .iter()
        .filter(|(prefix, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())
    else {
        return 0.0;
    };

    (prompt_tokens as f64 * prompt_price + completion_tokens as f64 * completion_price) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        // gpt-5-mini must not be priced at gpt-5 rates.
        let mini = approx_cost("gpt-5-mini", 1_000_000, 0);
        let full = approx_cost("gpt-5", 1_000_000, 0);
        assert!(mini < full);
        assert!((mini - 0.25).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(approx_cost("nobody/heard-of-it", 10_000, 10_000), 0.0);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(approx_cost("gpt-5", 0, 0), 0.0);
    }
}
