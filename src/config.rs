use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level service configuration, deserialized from JSON and passed
/// explicitly to the components that need it. There is no process-wide
/// config state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub limits: RequestLimits,
    #[serde(default)]
    pub credits: CreditsConfig,
    /// Model id -> billing rates, in credits per 1000 tokens.
    #[serde(default)]
    pub models: BTreeMap<String, ModelRateConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestLimits {
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_text_chars: default_max_text_chars(),
            max_prompt_chars: default_max_prompt_chars(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditsConfig {
    /// Balance granted to a newly created account, in whole credits.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: u64,
    /// Scale factor from fractional credits to the integer micro-credit
    /// unit balances are stored in.
    #[serde(default = "default_base_multiplier")]
    pub base_multiplier: u64,
}

impl CreditsConfig {
    pub fn starting_balance_micro(&self) -> i64 {
        let micro = self.starting_balance.saturating_mul(self.base_multiplier);
        if micro > i64::MAX as u64 {
            i64::MAX
        } else {
            micro as i64
        }
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            base_multiplier: default_base_multiplier(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModelRateConfig {
    pub input_rate_per_1k: f64,
    pub output_rate_per_1k: f64,
}

fn default_max_text_chars() -> usize {
    4000
}

fn default_max_prompt_chars() -> usize {
    1000
}

fn default_max_context_chars() -> usize {
    2000
}

fn default_starting_balance() -> u64 {
    1000
}

fn default_base_multiplier() -> u64 {
    1_000_000
}
