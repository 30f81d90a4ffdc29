use std::collections::HashMap;

use thiserror::Error;

use crate::config::ModelRateConfig;

/// Billing rates for every model the service is willing to meter, converted
/// once at construction into integer micro-credits per 1000 tokens so that
/// per-request cost is pure integer arithmetic.
#[derive(Clone, Debug, Default)]
pub struct RateTable {
    models: HashMap<String, ModelRates>,
    base_multiplier: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct ModelRates {
    pub input_micro_per_1k: u64,
    pub output_micro_per_1k: u64,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("invalid rate for model {model}: {field} must be a finite non-negative number")]
    InvalidRate { model: String, field: &'static str },
}

impl RateTable {
    pub fn from_config(
        models: impl IntoIterator<Item = (String, ModelRateConfig)>,
        base_multiplier: u64,
    ) -> Result<Self, PricingError> {
        let mut table = HashMap::new();
        for (model, rates) in models {
            let input_micro_per_1k =
                rate_to_micro_per_1k(rates.input_rate_per_1k, base_multiplier, &model, "input_rate_per_1k")?;
            let output_micro_per_1k =
                rate_to_micro_per_1k(rates.output_rate_per_1k, base_multiplier, &model, "output_rate_per_1k")?;
            table.insert(
                model,
                ModelRates {
                    input_micro_per_1k,
                    output_micro_per_1k,
                },
            );
        }
        Ok(Self {
            models: table,
            base_multiplier,
        })
    }

    pub fn base_multiplier(&self) -> u64 {
        self.base_multiplier
    }

    pub fn model_rates(&self, model: &str) -> Result<ModelRates, PricingError> {
        self.models
            .get(model)
            .copied()
            .ok_or_else(|| PricingError::UnknownModel {
                model: model.to_string(),
            })
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Cost of a generation in micro-credits:
    /// `ceil(((input/1000)*input_rate + (output/1000)*output_rate) * multiplier)`.
    ///
    /// The rates are already scaled by the multiplier, so this reduces to a
    /// single ceiling division and never under-charges a fractional credit.
    pub fn cost_micro_credits(
        &self,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<u64, PricingError> {
        let rates = self.model_rates(model)?;
        let input = u128::from(input_tokens) * u128::from(rates.input_micro_per_1k);
        let output = u128::from(output_tokens) * u128::from(rates.output_micro_per_1k);
        let total = input.saturating_add(output);
        let cost = total.div_ceil(1000);
        Ok(if cost > u128::from(u64::MAX) {
            u64::MAX
        } else {
            cost as u64
        })
    }
}

fn rate_to_micro_per_1k(
    rate_per_1k: f64,
    base_multiplier: u64,
    model: &str,
    field: &'static str,
) -> Result<u64, PricingError> {
    if !rate_per_1k.is_finite() || rate_per_1k < 0.0 {
        return Err(PricingError::InvalidRate {
            model: model.to_string(),
            field,
        });
    }
    let micro = (rate_per_1k * base_multiplier as f64).round();
    if !micro.is_finite() || micro < 0.0 {
        return Err(PricingError::InvalidRate {
            model: model.to_string(),
            field,
        });
    }
    Ok(if micro > u64::MAX as f64 {
        u64::MAX
    } else {
        micro as u64
    })
}
