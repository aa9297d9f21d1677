//! In-process backend: a TorchScript vision-language module driven by a
//! greedy decoding loop.
//!
//! The traced module is expected to accept `input_ids: Long[1, L]` and,
//! when an image is attached, `pixel_values: Float[1, 3, H, W]` (RGB scaled
//! to `0..=1`), returning logits shaped `[1, L, vocab]` either directly or as
//! the first element of a tuple.

use std::{fs, path::Path, sync::Arc, time::Instant};

use async_trait::async_trait;
use image::RgbImage;
use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{DecodeParams, GenerationPrompt, ModelMetadata, VisionLanguageModel},
};

pub struct TorchVlm {
    inner: Arc<ModelInstance>,
}

struct ModelInstance {
    name: String,
    source: String,
    size_bytes: u64,
    device: Device,
    eos_token_id: Option<i64>,
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
}

impl TorchVlm {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let tokenizer = Tokenizer::from_file(config.tokenizer_path.as_path())
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let eos_token_id = tokenizer.token_to_id(&config.eos_token).map(i64::from);
        if eos_token_id.is_none() {
            tracing::warn!(token = %config.eos_token, "end-of-sequence token not in vocabulary");
        }

        let device = parse_device(&config.device);
        let inner = ModelInstance::new(&config.model_path, device, eos_token_id, tokenizer)?;
        info!(
            path = %config.model_path.display(),
            size_bytes = inner.size_bytes,
            ?device,
            "torchscript module loaded"
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

#[async_trait]
impl VisionLanguageModel for TorchVlm {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.inner.name.clone(),
            backend: "torch".to_string(),
            source: self.inner.source.clone(),
            size_bytes: Some(self.inner.size_bytes),
        }
    }

    async fn generate(
        &self,
        prompt: GenerationPrompt,
        params: DecodeParams,
    ) -> Result<String, ServiceError> {
        let model = self.inner.clone();
        tokio::task::spawn_blocking(move || model.generate(&prompt, params))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    fn release_cache(&self) {
        if let Device::Cuda(index) = self.inner.device {
            off_async_worker(move || tch::Cuda::synchronize(index as i64));
        }
    }
}

impl ModelInstance {
    fn new(
        module_path: &Path,
        device: Device,
        eos_token_id: Option<i64>,
        tokenizer: Tokenizer,
    ) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let size_bytes = fs::metadata(module_path)?.len();
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();

        let name = module_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "torchscript".to_string());

        Ok(Self {
            name,
            source: module_path.display().to_string(),
            size_bytes,
            device,
            eos_token_id,
            tokenizer,
            module: Mutex::new(module),
        })
    }

    fn generate(
        &self,
        prompt: &GenerationPrompt,
        params: DecodeParams,
    ) -> Result<String, ServiceError> {
        let rendered = chat_template(&prompt.text, prompt.image.is_some());
        let encoding = self
            .tokenizer
            .encode(rendered, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        if input_ids.is_empty() {
            return Err(ServiceError::Tokenizer("prompt encoded to zero tokens".into()));
        }
        let prompt_token_len = input_ids.len();

        let pixel_values = prompt
            .image
            .as_ref()
            .map(|image| image_tensor(image, self.device));

        let start = Instant::now();

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..params.max_new_tokens {
                let ids = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);
                let mut inputs = vec![IValue::Tensor(ids)];
                if let Some(pixels) = pixel_values.as_ref() {
                    inputs.push(IValue::Tensor(pixels.shallow_clone()));
                }

                let output = module
                    .forward_is(&inputs)
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;
                let logits = match output {
                    IValue::Tensor(t) => t,
                    IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                // [1, seq, vocab] -> [vocab] at the last position
                let last_logits = logits.select(1, -1).squeeze();
                let next_token_id = last_logits.argmax(0, false).int64_value(&[]);
                if Some(next_token_id) == self.eos_token_id {
                    break;
                }
                input_ids.push(next_token_id);
            }

            Ok::<(), ServiceError>(())
        })?;

        // Drop the echoed prompt; only new tokens are decoded.
        let generated_ids: Vec<u32> = input_ids[prompt_token_len..]
            .iter()
            .map(|&id| id as u32)
            .collect();
        debug!(
            tokens = generated_ids.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "decoding loop finished"
        );

        self.tokenizer
            .decode(&generated_ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }
}

/// Run `task` on the blocking pool when called from inside the runtime.
/// Device synchronization can wait for a detached generation to finish and
/// must not stall an async worker.
fn off_async_worker<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(task);
        }
        Err(_) => task(),
    }
}

/// Single-turn chat wrapper in the ChatML layout used by Qwen-VL checkpoints.
fn chat_template(text: &str, with_image: bool) -> String {
    let vision = if with_image {
        "<|vision_start|><|image_pad|><|vision_end|>"
    } else {
        ""
    };
    format!(
        "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
         <|im_start|>user\n{vision}{text}<|im_end|>\n\
         <|im_start|>assistant\n"
    )
}

/// HWC u8 -> NCHW f32 in `0..=1`.
fn image_tensor(image: &RgbImage, device: Device) -> Tensor {
    let (width, height) = image.dimensions();
    let pixels = Tensor::from_slice(image.as_raw())
        .view([i64::from(height), i64::from(width), 3])
        .permute([2, 0, 1])
        .unsqueeze(0)
        .to_kind(Kind::Float);
    (pixels / 255.0).to(device)
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_template_marks_image_slot() {
        let with = chat_template("read", true);
        assert!(with.contains("<|vision_start|><|image_pad|><|vision_end|>read<|im_end|>"));
        assert!(with.ends_with("<|im_start|>assistant\n"));
        assert!(!chat_template("read", false).contains("<|image_pad|>"));
    }

    #[test]
    fn image_tensor_is_nchw() {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([255, 0, 0]));
        let tensor = image_tensor(&image, Device::Cpu);
        assert_eq!(tensor.size(), vec![1, 3, 2, 4]);
        assert_eq!(tensor.double_value(&[0, 0, 1, 3]), 1.0);
        assert_eq!(tensor.double_value(&[0, 1, 1, 3]), 0.0);
    }

    #[tokio::test]
    async fn release_work_leaves_the_async_worker() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let caller = std::thread::current().id();
        off_async_worker(move || {
            let _ = tx.send(std::thread::current().id());
        });
        let worker = rx.await.unwrap();
        assert_ne!(worker, caller);
    }

    #[test]
    fn release_work_runs_inline_without_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        off_async_worker(move || tx.send(std::thread::current().id()).unwrap());
        assert_eq!(rx.try_recv().ok(), Some(std::thread::current().id()));
    }

    #[test]
    fn unknown_devices_fall_back_to_cpu() {
        assert_eq!(parse_device("cpu"), Device::Cpu);
        assert_eq!(parse_device("tpu"), Device::Cpu);
    }
}
