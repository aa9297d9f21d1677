pub mod config;
pub mod error;
pub mod model;
pub mod preprocess;
pub mod prompts;
pub mod sanitize;
pub mod server;

pub use config::{AppConfig, BackendKind};
pub use error::ServiceError;
pub use model::{GenerationPrompt, ModelService, VisionLanguageModel};
pub use preprocess::ImageNormalizer;
pub use sanitize::{Sanitizer, sanitize};
pub use server::build_router;
