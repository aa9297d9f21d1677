use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Input to a single generation call.
#[derive(Debug, Clone)]
pub struct GenerationPrompt {
    pub text: String,
    pub image: Option<RgbImage>,
}

impl GenerationPrompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(text: impl Into<String>, image: RgbImage) -> Self {
        Self {
            text: text.into(),
            image: Some(image),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodeParams {
    pub max_new_tokens: usize,
    /// Always `true` for this service: outputs must be reproducible.
    pub greedy: bool,
}

impl DecodeParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            greedy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub backend: String,
    pub source: String,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
}
