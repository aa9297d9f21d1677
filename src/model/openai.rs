//! Backend for a vision-language model served locally behind an
//! OpenAI-compatible `/chat/completions` endpoint (llama.cpp server, vLLM,
//! Ollama, LM Studio).

use std::io::Cursor;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{DecodeParams, GenerationPrompt, ModelMetadata, VisionLanguageModel},
};

pub struct OpenAiVlm {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiVlm {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ServiceError::Other(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: completions_url(&config.openai_base_url),
            model: config.openai_model.clone(),
            api_key: config.openai_api_key.clone(),
        })
    }

    fn request_body(&self, text: &str, image_url: Option<String>, params: DecodeParams) -> Value {
        let mut content = Vec::with_capacity(2);
        if let Some(url) = image_url {
            content.push(json!({ "type": "image_url", "image_url": { "url": url } }));
        }
        content.push(json!({ "type": "text", "text": text }));

        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": params.max_new_tokens,
            "stream": false,
        });
        if params.greedy {
            body["temperature"] = json!(0.0);
            body["top_p"] = json!(1.0);
        }
        body
    }
}

#[async_trait]
impl VisionLanguageModel for OpenAiVlm {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.model.clone(),
            backend: "openai".to_string(),
            source: self.endpoint.clone(),
            size_bytes: None,
        }
    }

    async fn generate(
        &self,
        prompt: GenerationPrompt,
        params: DecodeParams,
    ) -> Result<String, ServiceError> {
        let GenerationPrompt { text, image } = prompt;
        let image_url = match image {
            Some(image) => Some(
                tokio::task::spawn_blocking(move || png_data_uri(&image))
                    .await
                    .map_err(|e| ServiceError::Other(format!("image encoding task failed: {e}")))??,
            ),
            None => None,
        };

        let body = self.request_body(&text, image_url, params);
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Inference(format!("request to {} failed: {e}", self.endpoint)))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Inference(format!(
                "model server returned {status}: {detail}"
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| ServiceError::Inference(format!("malformed completion: {e}")))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::Inference("completion has no content".into()))?;

        debug!(chars = content.len(), "received completion");
        Ok(content)
    }
}

fn completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn png_data_uri(image: &RgbImage) -> Result<String, ServiceError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiVlm {
        let config = AppConfig {
            openai_base_url: "http://localhost:8000/v1/".into(),
            openai_model: "local-vlm".into(),
            ..AppConfig::default()
        };
        OpenAiVlm::new(&config).unwrap()
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        assert_eq!(
            completions_url("http://localhost:8000/v1/"),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://host/v1/chat/completions"),
            "http://host/v1/chat/completions"
        );
    }

    #[test]
    fn text_only_body_is_greedy_and_bounded() {
        let body = backend().request_body("hello", None, DecodeParams::greedy(1024));
        assert_eq!(body["model"], "local-vlm");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["temperature"], 0.0);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["text"], "hello");
    }

    #[test]
    fn image_part_precedes_text() {
        let url = png_data_uri(&RgbImage::new(2, 2)).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        let body = backend().request_body("read this", Some(url), DecodeParams::greedy(16));
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "image_url");
        assert_eq!(content[1]["type"], "text");
    }

    #[test]
    fn metadata_reports_endpoint() {
        let meta = backend().metadata();
        assert_eq!(meta.backend, "openai");
        assert_eq!(meta.source, "http://localhost:8000/v1/chat/completions");
    }
}
