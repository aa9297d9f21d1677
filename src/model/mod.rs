mod backend;
#[cfg(feature = "tch-backend")]
mod loader;
mod openai;
mod service;
mod types;

pub use backend::VisionLanguageModel;
#[cfg(feature = "tch-backend")]
pub use loader::TorchVlm;
pub use openai::OpenAiVlm;
pub use service::{ModelService, ReleaseGuard};
pub use types::{DecodeParams, GenerationPrompt, ModelMetadata, TextResponse};
