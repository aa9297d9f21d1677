use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::{preprocess::DEFAULT_MAX_PIXELS, sanitize::DEFAULT_MIN_DEDUP_KEY_LEN};

pub const DEFAULT_PORT: u16 = 5000;

/// Which implementation answers `generate` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// TorchScript module loaded in-process (`tch-backend` feature).
    Torch,
    /// OpenAI-compatible chat-completions server on the local machine.
    OpenAi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Torch => "torch",
            BackendKind::OpenAi => "openai",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "torch" | "tch" | "torchscript" => Ok(BackendKind::Torch),
            "openai" | "http" | "remote" => Ok(BackendKind::OpenAi),
            other => Err(format!("unknown model backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendKind,
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub device: String,
    pub eos_token: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_api_key: Option<String>,
    pub max_new_tokens: usize,
    pub max_pixels: u64,
    pub dedup_min_key_len: usize,
    /// `None` disables the generation deadline.
    pub generation_timeout: Option<Duration>,
    pub max_body_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            backend: BackendKind::OpenAi,
            model_path: PathBuf::from("models/vlm.ts"),
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            device: "cpu".to_string(),
            eos_token: "<|im_end|>".to_string(),
            openai_base_url: "http://127.0.0.1:8000/v1".to_string(),
            openai_model: "qwen2.5-vl-7b-instruct".to_string(),
            openai_api_key: None,
            max_new_tokens: 1024,
            max_pixels: DEFAULT_MAX_PIXELS,
            dedup_min_key_len: DEFAULT_MIN_DEDUP_KEY_LEN,
            generation_timeout: Some(Duration::from_secs(300)),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let backend = match env::var("MODEL_BACKEND") {
            Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            Err(_) => defaults.backend,
        };

        let model_path = env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_path);
        let tokenizer_path = env::var("TOKENIZER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tokenizer_path);
        let device = env::var("DEVICE").unwrap_or(defaults.device);
        let eos_token = env::var("EOS_TOKEN").unwrap_or(defaults.eos_token);

        let openai_base_url = env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url);
        let openai_model = env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model);
        let openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());

        let max_new_tokens = parse_or("MAX_NEW_TOKENS", defaults.max_new_tokens);
        let max_pixels = parse_or("MAX_PIXELS", defaults.max_pixels);
        let dedup_min_key_len = parse_or("DEDUP_MIN_KEY_LEN", defaults.dedup_min_key_len);
        let generation_timeout = match env::var("GENERATION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.generation_timeout,
        };
        let max_body_bytes = parse_or("MAX_BODY_BYTES", defaults.max_body_bytes);

        Ok(Self {
            listen_addr,
            backend,
            model_path,
            tokenizer_path,
            device,
            eos_token,
            openai_base_url,
            openai_model,
            openai_api_key,
            max_new_tokens,
            max_pixels,
            dedup_min_key_len,
            generation_timeout,
            max_body_bytes,
        })
    }
}

fn parse_or<T: FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}
