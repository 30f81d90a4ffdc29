use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// One optimize request as the backend sees it. Prompt rendering (system
/// instructions, language hints) is the backend implementation's business.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub model: String,
    pub text: String,
    pub language: Option<String>,
    pub custom_prompt: Option<String>,
    pub context: Option<String>,
}

/// Token counts as reported by the provider. Either side may be absent;
/// the orchestrator falls back to its own estimates.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct GenerationChunk {
    pub text: String,
    /// Providers that meter usage attach it to the final chunk.
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("provider connection error: {0}")]
    Connect(String),
    #[error("malformed provider stream: {0}")]
    InvalidStream(String),
}

pub type GenerationStream = BoxStream<'static, Result<GenerationChunk, ProviderError>>;

impl std::fmt::Debug for dyn ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBackend")
            .field("name", &self.name())
            .finish()
    }
}

/// A streaming text-generation backend. Implementations wrap a provider
/// SDK or HTTP API; the ledger core never sees past this seam.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: GenerationRequest)
    -> Result<GenerationStream, ProviderError>;
}
