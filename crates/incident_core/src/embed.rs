use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::config::EmbeddingConfig;
use crate::minilm_embed::MiniLmEmbeddingProvider;

pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dim(&self) -> usize;

    fn name(&self) -> &str;
}

impl EmbeddingProvider for Box<dyn EmbeddingProvider> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Hashed bag-of-words vectors. No model files required, so it backs tests
/// and machines without the MiniLM weights.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dim: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self { dim: 384 }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut h: u64 = 1469598103934665603;
            for b in token.as_bytes() {
                h ^= *b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h as usize) % self.dim] += 1.0;
        }

        l2_normalize(&mut v);
        Ok(v)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// MiniLM when both model files exist, the hashed fallback when neither does.
pub fn load_embedder(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    let model = config.model_path.exists();
    let tokenizer = config.tokenizer_path.exists();
    match (model, tokenizer) {
        (true, true) => {
            info!(model = %config.model_path.display(), "loading MiniLM embedding model");
            let provider =
                MiniLmEmbeddingProvider::load(&config.model_path, &config.tokenizer_path)?
                    .with_batch_size(config.batch_size);
            Ok(Box::new(provider))
        }
        (false, false) => {
            warn!(
                model = %config.model_path.display(),
                "embedding model not found, using hashed embeddings"
            );
            Ok(Box::new(HashEmbeddingProvider::new(config.fallback_dim)))
        }
        (true, false) => bail!(
            "tokenizer {} missing for model {}",
            config.tokenizer_path.display(),
            config.model_path.display()
        ),
        (false, true) => bail!(
            "model {} missing for tokenizer {}",
            config.model_path.display(),
            config.tokenizer_path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn hash_embeddings_are_unit_length_and_deterministic() {
        let p = HashEmbeddingProvider::new(64);
        let a = p.embed("VPN connection failed").unwrap();
        let b = p.embed("vpn   CONNECTION failed").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let p = HashEmbeddingProvider::new(16);
        assert!(p.embed("").unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn batch_matches_single_embeds() {
        let p = HashEmbeddingProvider::new(32);
        let batch = p.embed_batch(&["one", "two words"]).unwrap();
        assert_eq!(batch[1], p.embed("two words").unwrap());
    }

    #[test]
    fn loader_falls_back_without_model_files() {
        let config = EmbeddingConfig {
            model_path: PathBuf::from("/nope/model.safetensors"),
            tokenizer_path: PathBuf::from("/nope/tokenizer.json"),
            fallback_dim: 48,
            batch_size: 4,
        };
        let embedder = load_embedder(&config).unwrap();
        assert_eq!(embedder.name(), "hash");
        assert_eq!(embedder.dim(), 48);
    }

    #[test]
    fn loader_rejects_half_configured_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.safetensors");
        std::fs::write(&model, b"").unwrap();
        let config = EmbeddingConfig {
            model_path: model,
            tokenizer_path: dir.path().join("tokenizer.json"),
            ..EmbeddingConfig::default()
        };
        assert!(load_embedder(&config).is_err());
    }
}
