//! Per-model pricing constants and call costing.

use std::collections::HashMap;

/// USD per 1M tokens, (input, output).
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, (f64, f64)>,
}

impl PricingTable {
    /// The built-in table for the supported providers.
    pub fn builtin() -> Self {
        let mut prices = HashMap::new();
        // OpenAI
        prices.insert("gpt-4-turbo-preview".to_string(), (10.0, 30.0));
        prices.insert("gpt-4-turbo".to_string(), (10.0, 30.0));
        prices.insert("gpt-4o".to_string(), (5.0, 15.0));
        prices.insert("gpt-4o-mini".to_string(), (0.15, 0.60));
        prices.insert("gpt-4".to_string(), (30.0, 60.0));
        prices.insert("gpt-3.5-turbo".to_string(), (0.5, 1.5));
        // Anthropic
        prices.insert("claude-3-opus-20240229".to_string(), (15.0, 75.0));
        prices.insert("claude-3-sonnet-20240229".to_string(), (3.0, 15.0));
        prices.insert("claude-3-haiku-20240307".to_string(), (0.25, 1.25));
        prices.insert("claude-3-5-sonnet-20241022".to_string(), (3.0, 15.0));
        Self { prices }
    }

    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    pub fn insert(&mut self, model: impl Into<String>, input: f64, output: f64) {
        self.prices.insert(model.into(), (input, output));
    }

    /// Cost one call. `None` when the model is unknown — callers treat that
    /// as cost 0 with a non-fatal warning on the node.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        let (input_price, output_price) = self.prices.get(model)?;
        let input_cost = (input_tokens as f64 / 1_000_000.0) * input_price;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * output_price;
        Some(input_cost + output_cost)
    }
}
