//! Model pricing and cost calculation.
//!
//! Prices are expressed per 1000 tokens. Unknown models fall back to the
//! default rate instead of failing.

use crate::config::RatesConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default LLM price when a model has no entry (per 1000 tokens).
pub const DEFAULT_LLM_RATE: LlmRate = LlmRate {
    prompt: 0.001,
    completion: 0.002,
};

/// Default embedding price when a model has no entry (per 1000 tokens).
pub const DEFAULT_EMBEDDING_RATE: f64 = 0.0001;

/// Prompt/completion price pair for an LLM, per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LlmRate {
    pub prompt: f64,
    pub completion: f64,
}

/// Pricing table keyed by model identifier.
#[derive(Debug, Clone)]
pub struct RateTable {
    llm: HashMap<String, LlmRate>,
    embedding: HashMap<String, f64>,
    default_llm: LlmRate,
    default_embedding: f64,
}

impl Default for RateTable {
    fn default() -> Self {
        let llm = [
            ("gpt-3.5-turbo", 0.0015, 0.002),
            ("gpt-4", 0.03, 0.06),
            ("gpt-4-turbo", 0.01, 0.03),
        ]
        .into_iter()
        .map(|(model, prompt, completion)| (model.to_string(), LlmRate { prompt, completion }))
        .collect();

        let embedding = [("text-embedding-ada-002", 0.0001)]
            .into_iter()
            .map(|(model, rate)| (model.to_string(), rate))
            .collect();

        Self {
            llm,
            embedding,
            default_llm: DEFAULT_LLM_RATE,
            default_embedding: DEFAULT_EMBEDDING_RATE,
        }
    }
}

impl RateTable {
    /// Built-in table with configured entries merged on top.
    pub fn from_config(config: &RatesConfig) -> Self {
        let mut table = Self::default();
        if let Some(rate) = config.default_llm {
            table.default_llm = rate;
        }
        if let Some(rate) = config.default_embedding {
            table.default_embedding = rate;
        }
        for (model, rate) in &config.llm {
            table.llm.insert(model.clone(), *rate);
        }
        for (model, rate) in &config.embedding {
            table.embedding.insert(model.clone(), *rate);
        }
        tracing::debug!(
            llm_models = table.llm.len(),
            embedding_models = table.embedding.len(),
            "Rate table loaded"
        );
        table
    }

    /// Price pair for an LLM model, or the default.
    pub fn llm_rate(&self, model: &str) -> LlmRate {
        self.llm.get(model).copied().unwrap_or(self.default_llm)
    }

    /// Price for an embedding model, or the default.
    pub fn embedding_rate(&self, model: &str) -> f64 {
        self.embedding
            .get(model)
            .copied()
            .unwrap_or(self.default_embedding)
    }

    /// Cost of one LLM call: prompt and completion priced independently.
    pub fn llm_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let rate = self.llm_rate(model);
        per_thousand(prompt_tokens, rate.prompt) + per_thousand(completion_tokens, rate.completion)
    }

    /// Cost of one embedding call.
    pub fn embedding_cost(&self, model: &str, token_count: u32) -> f64 {
        per_thousand(token_count, self.embedding_rate(model))
    }
}

fn per_thousand(tokens: u32, rate: f64) -> f64 {
    (f64::from(tokens) / 1000.0 * rate).max(0.0)
}
