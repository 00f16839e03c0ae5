//! Per-model token pricing, USD per million tokens.

use clipsmith_core::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl ModelPricing {
    const fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_per_m + tokens_out as f64 * self.output_per_m) / 1_000_000.0
    }
}

const PRICES: &[(&str, ModelPricing)] = &[
    ("claude-opus-4", ModelPricing::new(15.0, 75.0)),
    ("claude-sonnet-4", ModelPricing::new(3.0, 15.0)),
    ("claude-3-5-sonnet", ModelPricing::new(3.0, 15.0)),
    ("claude-3-5-haiku", ModelPricing::new(0.8, 4.0)),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.6)),
    ("gpt-4o", ModelPricing::new(2.5, 10.0)),
    ("gpt-4-turbo", ModelPricing::new(10.0, 30.0)),
    ("gemini-2.0-flash", ModelPricing::new(0.075, 0.3)),
    ("gemini-1.5-flash", ModelPricing::new(0.075, 0.3)),
    ("gemini-1.5-pro", ModelPricing::new(1.25, 5.0)),
    ("grok-3", ModelPricing::new(3.0, 15.0)),
    ("grok-4", ModelPricing::new(3.0, 15.0)),
    ("deepseek-chat", ModelPricing::new(0.27, 1.10)),
    ("deepseek-reasoner", ModelPricing::new(0.55, 2.19)),
    ("llama-3.3-70b", ModelPricing::new(0.59, 0.79)),
    ("llama-3.1-8b", ModelPricing::new(0.05, 0.08)),
];

fn fallback(kind: ProviderKind) -> ModelPricing {
    match kind {
        ProviderKind::Anthropic => ModelPricing::new(3.0, 15.0),
        ProviderKind::OpenAI => ModelPricing::new(2.5, 10.0),
        ProviderKind::Google => ModelPricing::new(0.075, 0.3),
        ProviderKind::Xai => ModelPricing::new(3.0, 15.0),
        ProviderKind::DeepSeek => ModelPricing::new(0.27, 1.10),
        ProviderKind::Groq => ModelPricing::new(0.59, 0.79),
        ProviderKind::Scripted => ModelPricing::new(0.0, 0.0),
    }
}

/// Longest matching model-id prefix wins, so dated ids
/// (`claude-sonnet-4-20250514`) and `-mini` variants resolve correctly.
pub fn pricing_for(kind: ProviderKind, model: &str) -> ModelPricing {
    if kind == ProviderKind::Scripted {
        return fallback(kind);
    }
    PRICES
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, p)| *p)
        .unwrap_or_else(|| fallback(kind))
}

pub fn estimate_cost(kind: ProviderKind, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    pricing_for(kind, model).cost(tokens_in, tokens_out)
}
