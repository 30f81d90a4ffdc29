//! Credits ledger and request-authorization core for the redline
//! text-optimization service.
//!
//! The ledger meters streamed LLM generations in integer micro-credits:
//! a pure [`pricing::RateTable`] computes costs, the SQLite-backed
//! [`store::LedgerStore`] owns balances and the usage log, and the
//! [`orchestrator::Optimizer`] sequences gate, generation, settlement, and
//! audit so every request is billed exactly once. [`http::router`] exposes
//! the whole thing as an axum service; the host application supplies the
//! [`provider::ModelBackend`] implementations.

pub mod config;
pub mod gate;
pub mod http;
pub mod orchestrator;
pub mod pricing;
pub mod provider;
pub mod records;
pub mod registry;
pub mod store;
pub mod tokens;

pub use config::{CreditsConfig, ModelRateConfig, RequestLimits, ServiceConfig};
pub use gate::GateError;
pub use http::{AppState, router};
pub use orchestrator::{
    OptimizeError, OptimizeOutcome, OptimizeRequest, OptimizeStream, Optimization, Optimizer,
};
pub use pricing::{ModelRates, PricingError, RateTable};
pub use provider::{
    GenerationChunk, GenerationRequest, GenerationStream, ModelBackend, ProviderError, TokenUsage,
};
pub use records::{
    ReconciliationReport, TransactionKind, TransactionRecord, UsageLogRecord, UsageStatus,
    UserRecord,
};
pub use registry::{ModelRegistry, RegistryError};
pub use store::{LedgerError, LedgerStore};
