//! Cost Calculator
//!
//! Prices are keyed by `provider:model`. Token-metered entries carry USD per million
//! input/output tokens; per-unit entries (image generation) carry a flat unit price that
//! the token formula never applies.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ModelPrice {
    Tokens {
        input_per_million: f64,
        output_per_million: f64,
    },
    PerUnit {
        per_image: f64,
    },
}

/// Read-only price lookup shared by all requests.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    entries: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new(entries: HashMap<String, ModelPrice>) -> Self {
        Self { entries }
    }

    pub fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelPrice> {
        self.entries.get(&Self::key(provider, model))
    }

    /// Token cost in USD. Unpriced models, and models priced per unit, cost zero.
    pub fn cost(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> f64 {
        match self.get(provider, model) {
            Some(ModelPrice::Tokens {
                input_per_million,
                output_per_million,
            }) => {
                prompt_tokens as f64 / 1e6 * input_per_million
                    + completion_tokens as f64 / 1e6 * output_per_million
            }
            Some(ModelPrice::PerUnit { .. }) => {
                tracing::debug!(
                    "{} is priced per unit; token cost reported as zero",
                    Self::key(provider, model)
                );
                0.0
            }
            None => 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
