use serde::{Deserialize, Serialize};
use serde_json::Value;

const TEXT_INPUT_USD_PER_TOKEN: f64 = 5.0 / 1_000_000.0;
const IMAGE_INPUT_USD_PER_TOKEN: f64 = 10.0 / 1_000_000.0;
const IMAGE_OUTPUT_USD_PER_TOKEN: f64 = 40.0 / 1_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostDetails {
    pub estimated_cost_usd: f64,
    pub text_input_tokens: u64,
    pub image_input_tokens: u64,
    pub image_output_tokens: u64,
}

/// Prices one request from the API `usage` block.
///
/// Returns `None` unless both the input token breakdown and the output token
/// count are present.
pub fn calculate_api_cost(usage: Option<&Value>) -> Option<CostDetails> {
    let usage = usage?.as_object()?;
    let input_details = usage.get("input_tokens_details")?.as_object()?;
    let image_output_tokens = usage.get("output_tokens").and_then(parse_token_count)?;
    let text_input_tokens = input_details
        .get("text_tokens")
        .and_then(parse_token_count)
        .unwrap_or(0);
    let image_input_tokens = input_details
        .get("image_tokens")
        .and_then(parse_token_count)
        .unwrap_or(0);

    let total = text_input_tokens as f64 * TEXT_INPUT_USD_PER_TOKEN
        + image_input_tokens as f64 * IMAGE_INPUT_USD_PER_TOKEN
        + image_output_tokens as f64 * IMAGE_OUTPUT_USD_PER_TOKEN;

    Some(CostDetails {
        estimated_cost_usd: round_to(total, 4),
        text_input_tokens,
        image_input_tokens,
        image_output_tokens,
    })
}

fn parse_token_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
