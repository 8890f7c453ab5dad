//! Rate table and token-to-credit conversion.

use crate::config::PricingConfig;
use crate::types::{to_micros, MicroCredits, SpendContext, TokenCategory, TokenUsage};
use serde::Deserialize;
use std::collections::HashMap;

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelRates {
    pub prompt: f64,
    pub completion: f64,
}

impl ModelRates {
    pub const fn new(prompt: f64, completion: f64) -> Self {
        Self { prompt, completion }
    }

    fn for_category(&self, category: TokenCategory) -> f64 {
        match category {
            TokenCategory::Prompt => self.prompt,
            TokenCategory::Completion => self.completion,
        }
    }
}

/// Built-in rates, matched against model names by substring.
const BUILTIN_RATES: &[(&str, ModelRates)] = &[
    ("gpt-3.5-turbo", ModelRates::new(0.5, 1.5)),
    ("gpt-4o-mini", ModelRates::new(0.15, 0.6)),
    ("gpt-4o", ModelRates::new(2.5, 10.0)),
    ("gpt-4-turbo", ModelRates::new(10.0, 30.0)),
    ("gpt-4", ModelRates::new(30.0, 60.0)),
    ("o1-mini", ModelRates::new(1.1, 4.4)),
    ("o1", ModelRates::new(15.0, 60.0)),
    ("claude-3-haiku", ModelRates::new(0.25, 1.25)),
    ("claude-3-5-haiku", ModelRates::new(0.8, 4.0)),
    ("claude-3-5-sonnet", ModelRates::new(3.0, 15.0)),
    ("claude-3-opus", ModelRates::new(15.0, 75.0)),
    ("gemini-1.5-flash", ModelRates::new(0.075, 0.3)),
    ("gemini-1.5-pro", ModelRates::new(1.25, 5.0)),
    ("deepseek", ModelRates::new(0.27, 1.1)),
];

/// Model → rate lookup.
///
/// A model name matches the longest table key it contains, so
/// `gpt-4o-mini-2024-07-18` resolves to `gpt-4o-mini` rather than `gpt-4o`.
#[derive(Debug, Clone)]
pub struct RateTable {
    rates: HashMap<String, ModelRates>,
    default_rate: ModelRates,
}

impl RateTable {
    /// Built-in table with the configured overrides and default applied.
    pub fn new(config: &PricingConfig) -> Self {
        let mut rates: HashMap<String, ModelRates> = BUILTIN_RATES
            .iter()
            .map(|(key, rate)| ((*key).to_string(), *rate))
            .collect();
        for (key, rate) in &config.models {
            rates.insert(key.to_lowercase(), *rate);
        }

        Self {
            rates,
            default_rate: config.default_rate,
        }
    }

    /// Rates resolved for a model name.
    pub fn rates_for(&self, model: &str) -> ModelRates {
        let model = model.to_lowercase();
        self.rates
            .iter()
            .filter(|(key, _)| model.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rate)| *rate)
            .unwrap_or(self.default_rate)
    }

    /// USD per million tokens for a model and token category.
    pub fn price_of(&self, model: &str, category: TokenCategory) -> f64 {
        self.rates_for(model).for_category(category)
    }
}

/// Apply the charge rounding policy to a raw credit amount.
///
/// - below `epsilon`: nothing is charged
/// - between `epsilon` and one credit: exactly `minimum_charge`
/// - one credit or more: rounded to two decimal places
pub fn round_charge(raw_credits: f64, config: &PricingConfig) -> MicroCredits {
    if !raw_credits.is_finite() || raw_credits < config.epsilon {
        return 0;
    }
    if raw_credits < 1.0 {
        return to_micros(config.minimum_charge);
    }
    to_micros((raw_credits * 100.0).round() / 100.0)
}

/// Pricing calculator combining the rate table with the rounding policy.
#[derive(Debug, Clone)]
pub struct PricingCalculator {
    table: RateTable,
    config: PricingConfig,
}

/// A priced charge before it is applied to any ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricedCharge {
    /// Effective USD per million tokens, cancel multiplier included.
    pub rate: f64,
    /// Unrounded credit amount.
    pub raw_credits: f64,
    /// Amount to charge after rounding.
    pub credits: MicroCredits,
}

impl PricingCalculator {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            table: RateTable::new(&config),
            config,
        }
    }

    pub fn table(&self) -> &RateTable {
        &self.table
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Effective rate for a category in a given context.
    ///
    /// Incomplete completions are billed at `rate * cancel_rate`.
    pub fn effective_rate(
        &self,
        model: &str,
        category: TokenCategory,
        context: SpendContext,
    ) -> f64 {
        let rate = self.table.price_of(model, category);
        if category == TokenCategory::Completion && context == SpendContext::Incomplete {
            rate * self.config.cancel_rate
        } else {
            rate
        }
    }

    /// Price `raw_tokens` of one category.
    ///
    /// Formula:
    /// - usd = raw_tokens * rate_per_million / 1_000_000
    /// - credits = usd / credit_unit_price
    pub fn price(
        &self,
        model: &str,
        category: TokenCategory,
        raw_tokens: u64,
        context: SpendContext,
    ) -> PricedCharge {
        let rate = self.effective_rate(model, category, context);
        let usd = raw_tokens as f64 * rate / 1_000_000.0;
        let raw_credits = usd / self.config.credit_unit_price;

        PricedCharge {
            rate,
            raw_credits,
            credits: round_charge(raw_credits, &self.config),
        }
    }

    /// Estimate credits for a message before it is sent.
    ///
    /// Uses a rough heuristic of ~4 characters per token. Completion size
    /// defaults to twice the prompt when no limit is given.
    pub fn estimate(
        &self,
        model: &str,
        message_chars: usize,
        max_completion_tokens: Option<u64>,
    ) -> MicroCredits {
        let prompt_tokens = (message_chars / 4).max(1) as u64;
        let completion_tokens = max_completion_tokens.unwrap_or(prompt_tokens * 2);
        self.estimate_usage(model, TokenUsage::new(prompt_tokens, completion_tokens))
    }

    /// Rounded charge for a full usage pair priced as a single amount.
    pub fn estimate_usage(&self, model: &str, usage: TokenUsage) -> MicroCredits {
        let prompt = self.price(model, TokenCategory::Prompt, usage.prompt_tokens, SpendContext::Message);
        let completion = self.price(
            model,
            TokenCategory::Completion,
            usage.completion_tokens,
            SpendContext::Message,
        );
        round_charge(prompt.raw_credits + completion.raw_credits, &self.config)
    }
}
