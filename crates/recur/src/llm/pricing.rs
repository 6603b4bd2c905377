use crate::llm::types::TokenUsage;

/// Estimate the cost in dollars for a given model and token usage.
///
/// Returns `None` for unknown models so the caller can distinguish "free"
/// from "unpriced"; totals over events with any unknown cost stay `None`.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> Option<f64> {
    let (input_per_m, output_per_m) = model_pricing(model)?;
    let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * input_per_m;
    let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * output_per_m;
    Some(input_cost + output_cost)
}

/// Format an optional cost for logs and prompts.
pub fn format_cost(cost: Option<f64>) -> String {
    match cost {
        Some(c) => format!("${c:.4}"),
        None => "unknown".into(),
    }
}

/// (input_per_million, output_per_million) rates for known models.
fn model_pricing(model: &str) -> Option<(f64, f64)> {
    match model {
        // Anthropic
        "claude-sonnet-4-5-20250514" => Some((3.0, 15.0)),
        "claude-opus-4-5-20250514" => Some((5.0, 25.0)),
        "claude-sonnet-4-20250514" => Some((3.0, 15.0)),
        "claude-opus-4-20250514" => Some((15.0, 75.0)),
        "claude-haiku-4-5-20251001" => Some((1.0, 5.0)),
        "claude-3-5-sonnet-20241022" | "claude-3-5-sonnet-20240620" => Some((3.0, 15.0)),
        "claude-3-5-haiku-20241022" => Some((0.80, 4.0)),
        "claude-3-haiku-20240307" => Some((0.25, 1.25)),
        // OpenAI (for embedders that bring their own provider)
        "gpt-4o" => Some((2.50, 10.0)),
        "gpt-4o-mini" => Some((0.15, 0.60)),
        "gpt-4.1" => Some((2.0, 8.0)),
        "gpt-4.1-mini" => Some((0.40, 1.60)),
        "o4-mini" => Some((1.10, 4.40)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mtok(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
        }
    }

    #[test]
    fn sonnet_pricing() {
        let cost = estimate_cost("claude-sonnet-4-20250514", &mtok(1_000_000, 1_000_000)).unwrap();
        // $3/M input + $15/M output = $18
        assert!((cost - 18.0).abs() < 0.001, "cost: {cost}");
    }

    #[test]
    fn mini_pricing() {
        let cost = estimate_cost("gpt-4o-mini", &mtok(1_000_000, 1_000_000)).unwrap();
        // $0.15/M input + $0.60/M output = $0.75
        assert!((cost - 0.75).abs() < 0.001, "cost: {cost}");
    }

    #[test]
    fn unknown_model_returns_none() {
        assert!(estimate_cost("some-local-model", &mtok(100, 50)).is_none());
    }

    #[test]
    fn zero_usage_is_zero_cost() {
        let cost = estimate_cost("claude-3-haiku-20240307", &TokenUsage::default()).unwrap();
        assert!(cost.abs() < f64::EPSILON);
    }

    #[test]
    fn format_cost_known_and_unknown() {
        assert_eq!(format_cost(Some(0.1234)), "$0.1234");
        assert_eq!(format_cost(None), "unknown");
    }
}
