use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::pricing::RateTable;
use crate::provider::ModelBackend;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("model {model} has a billing rate but no registered backend")]
    MissingBackend { model: String },
    #[error("backend registered for {model} which has no billing rate")]
    UnpricedBackend { model: String },
}

/// Startup-validated table from model id to its serving backend.
///
/// Dispatch is resolved here once, against the same key set as the rate
/// table, so a misconfigured model fails construction instead of a request.
#[derive(Debug)]
pub struct ModelRegistry {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl ModelRegistry {
    pub fn new(
        rates: &RateTable,
        backends: impl IntoIterator<Item = (String, Arc<dyn ModelBackend>)>,
    ) -> Result<Self, RegistryError> {
        let backends: HashMap<String, Arc<dyn ModelBackend>> = backends.into_iter().collect();

        for model in backends.keys() {
            if rates.model_rates(model).is_err() {
                return Err(RegistryError::UnpricedBackend {
                    model: model.clone(),
                });
            }
        }
        for model in rates.model_ids() {
            if !backends.contains_key(model) {
                return Err(RegistryError::MissingBackend {
                    model: model.to_string(),
                });
            }
        }

        Ok(Self { backends })
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn ModelBackend>, RegistryError> {
        self.backends
            .get(model)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownModel {
                model: model.to_string(),
            })
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}
