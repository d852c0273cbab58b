use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_1m_usd: f64,
    pub output_per_1m_usd: f64,
}

const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_1m_usd: 3.0,
    output_per_1m_usd: 15.0,
};

/// Static pricing table, ported from the original cost tracker's
/// `COST_PRICING` dict. Unknown models fall back to `DEFAULT_PRICING`.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    (
        "claude-haiku-4-5-20251001",
        ModelPricing { input_per_1m_usd: 0.8, output_per_1m_usd: 4.0 },
    ),
    (
        "claude-sonnet-4-20250514",
        ModelPricing { input_per_1m_usd: 3.0, output_per_1m_usd: 15.0 },
    ),
    (
        "claude-opus-4-6",
        ModelPricing { input_per_1m_usd: 15.0, output_per_1m_usd: 75.0 },
    ),
    (
        "claude-3-5-haiku-20241022",
        ModelPricing { input_per_1m_usd: 0.8, output_per_1m_usd: 4.0 },
    ),
    (
        "claude-3-5-sonnet-20241022",
        ModelPricing { input_per_1m_usd: 3.0, output_per_1m_usd: 15.0 },
    ),
    (
        "kimi-2.5",
        ModelPricing { input_per_1m_usd: 0.14, output_per_1m_usd: 0.28 },
    ),
    (
        "kimi",
        ModelPricing { input_per_1m_usd: 0.27, output_per_1m_usd: 0.68 },
    ),
    (
        "m2.5",
        ModelPricing { input_per_1m_usd: 0.30, output_per_1m_usd: 1.20 },
    ),
    (
        "gemini-2.5-flash-lite",
        ModelPricing { input_per_1m_usd: 0.10, output_per_1m_usd: 0.40 },
    ),
    (
        "gemini-2.5-flash",
        ModelPricing { input_per_1m_usd: 0.30, output_per_1m_usd: 2.50 },
    ),
    (
        "gemini-3-flash-preview",
        ModelPricing { input_per_1m_usd: 0.0, output_per_1m_usd: 0.0 },
    ),
];

pub fn pricing_for(model: &str) -> ModelPricing {
    PRICING_TABLE
        .iter()
        .find(|(id, _)| *id == model)
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_PRICING)
}

/// `cost = (in * p_in + out * p_out) / 1_000_000`, rounded to 6 decimals.
pub fn calculate_cost(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let pricing = pricing_for(model);
    let raw = (tokens_in as f64 * pricing.input_per_1m_usd
        + tokens_out as f64 * pricing.output_per_1m_usd)
        / 1_000_000.0;
    (raw * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub project: String,
    pub agent: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    #[serde(default)]
    pub metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_uses_default_tier() {
        let cost = calculate_cost("not-a-real-model", 1_000_000, 1_000_000);
        assert_eq!(cost, DEFAULT_PRICING.input_per_1m_usd + DEFAULT_PRICING.output_per_1m_usd);
    }

    #[test]
    fn known_model_matches_table() {
        let cost = calculate_cost("kimi-2.5", 1_000_000, 1_000_000);
        assert_eq!(cost, 0.14 + 0.28);
    }

    #[test]
    fn cost_is_never_negative() {
        assert!(calculate_cost("claude-opus-4-6", 0, 0) >= 0.0);
    }
}
