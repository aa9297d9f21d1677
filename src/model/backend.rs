use async_trait::async_trait;

use crate::{
    error::ServiceError,
    model::{DecodeParams, GenerationPrompt, ModelMetadata},
};

/// The opaque `generate(prompt, optional image) -> text` capability.
///
/// Implementations return only newly generated text; any echo of the prompt
/// must already be stripped.
#[async_trait]
pub trait VisionLanguageModel: Send + Sync {
    fn metadata(&self) -> ModelMetadata;

    async fn generate(
        &self,
        prompt: GenerationPrompt,
        params: DecodeParams,
    ) -> Result<String, ServiceError>;

    /// Drop transient accelerator state after a request. Best effort.
    fn release_cache(&self) {}
}
