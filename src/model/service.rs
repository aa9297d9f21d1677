use std::{sync::Arc, time::Duration, time::Instant};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    config::{AppConfig, BackendKind},
    error::ServiceError,
    model::{
        DecodeParams, GenerationPrompt, ModelMetadata, VisionLanguageModel, openai::OpenAiVlm,
    },
};

/// Process-wide owner of the model handle.
///
/// Generation calls are serialized through `gate`: the underlying model is
/// not assumed to tolerate concurrent invocations.
pub struct ModelService {
    model: Arc<dyn VisionLanguageModel>,
    gate: Mutex<()>,
    params: DecodeParams,
    timeout: Option<Duration>,
}

impl ModelService {
    pub fn new(
        model: Arc<dyn VisionLanguageModel>,
        params: DecodeParams,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            model,
            gate: Mutex::new(()),
            params,
            timeout,
        }
    }

    /// Load the backend selected by `config`. Failures here are fatal for
    /// the process.
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let model: Arc<dyn VisionLanguageModel> = match config.backend {
            BackendKind::OpenAi => Arc::new(OpenAiVlm::new(config)?),
            #[cfg(feature = "tch-backend")]
            BackendKind::Torch => Arc::new(crate::model::TorchVlm::load(config)?),
            #[cfg(not(feature = "tch-backend"))]
            BackendKind::Torch => {
                return Err(ServiceError::Other(
                    "torch backend requested but the binary was built without the \
                     `tch-backend` feature"
                        .into(),
                ));
            }
        };

        let metadata = model.metadata();
        info!(
            backend = %metadata.backend,
            model = %metadata.name,
            source = %metadata.source,
            "model ready"
        );

        Ok(Self::new(
            model,
            DecodeParams::greedy(config.max_new_tokens),
            config.generation_timeout,
        ))
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.model.metadata()
    }

    pub fn params(&self) -> DecodeParams {
        self.params
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run one generation, waiting for any in-flight call to finish first.
    pub async fn generate(&self, prompt: GenerationPrompt) -> Result<String, ServiceError> {
        let _turn = self.gate.lock().await;
        let has_image = prompt.image.is_some();
        let started = Instant::now();
        debug!(has_image, prompt_chars = prompt.text.len(), "generation started");

        let call = self.model.generate(prompt, self.params);
        let raw = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ServiceError::Timeout(limit))??,
            None => call.await?,
        };

        info!(
            has_image,
            elapsed_ms = started.elapsed().as_millis() as u64,
            output_chars = raw.len(),
            "generation finished"
        );
        Ok(raw)
    }

    /// Guard that releases model caches when dropped, whatever the outcome
    /// of the request holding it.
    pub fn release_guard(&self) -> ReleaseGuard<'_> {
        ReleaseGuard {
            model: self.model.as_ref(),
        }
    }
}

pub struct ReleaseGuard<'a> {
    model: &'a dyn VisionLanguageModel,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.model.release_cache();
    }
}
