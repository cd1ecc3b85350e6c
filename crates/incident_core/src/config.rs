use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_MODEL_PATH: &str = "./models/all-MiniLM-L6-v2.safetensors";
pub const DEFAULT_TOKENIZER_PATH: &str = "./models/all-MiniLM-L6-v2-tokenizer.json";
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_MIN_SCORE: f32 = 0.25;
pub const DEFAULT_LLM_MODEL: &str = "gemini-pro";
pub const DEFAULT_LLM_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub clustering: ClusterConfig,
    pub llm: LlmConfig,
    pub heal: HealConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
    pub model_dir: PathBuf,
    pub frontend_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            index_dir: PathBuf::from("./index_store"),
            model_dir: PathBuf::from("./models"),
            frontend_dir: PathBuf::from("./frontend"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    /// Dimension of the hashed fallback when no model files are present.
    pub fallback_dim: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            tokenizer_path: PathBuf::from(DEFAULT_TOKENIZER_PATH),
            fallback_dim: DEFAULT_EMBEDDING_DIM,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    /// Hits with a cosine score below this are dropped.
    pub min_score: f32,
    pub auto_rebuild: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: DEFAULT_MIN_SCORE,
            auto_rebuild: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub eps: f32,
    pub min_samples: usize,
    pub min_cluster_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps: 0.55,
            min_samples: 3,
            min_cluster_size: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    pub delay_ms: u64,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self { delay_ms: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl AppConfig {
    /// Read the TOML file when it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_toml(&std::fs::read_to_string(p)?)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = Some(SecretString::from(key));
        }
        if let Some(dir) = var("INCIDENT_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("INCIDENT_INDEX_DIR") {
            self.paths.index_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("INCIDENT_MODEL_DIR") {
            self.paths.model_dir = PathBuf::from(dir);
        }
        if let Some(bind) = var("INCIDENT_BIND") {
            self.server.bind = bind;
        }
    }
}
