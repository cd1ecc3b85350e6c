//! all-MiniLM-L6-v2 sentence encoder on candle.
//!
//! Texts are encoded in padded batches. Padding positions are masked out of
//! attention and out of the mean pool, so a sentence embeds to the same
//! vector alone or alongside longer neighbours.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use serde::Deserialize;
use std::path::Path;

use crate::embed::{l2_normalize, EmbeddingProvider};

/// Subset of a BERT `config.json`. Defaults are all-MiniLM-L6-v2.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct BertConfig {
    hidden_size: usize,
    intermediate_size: usize,
    num_attention_heads: usize,
    num_hidden_layers: usize,
    vocab_size: usize,
    max_position_embeddings: usize,
    type_vocab_size: usize,
    layer_norm_eps: f64,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            hidden_size: 384,
            intermediate_size: 1536,
            num_attention_heads: 12,
            num_hidden_layers: 6,
            vocab_size: 30522,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
        }
    }
}

impl BertConfig {
    /// Reads `config.json` beside the weights when there is one.
    fn for_model(model_path: &Path) -> Result<Self> {
        let candidate = model_path.with_file_name("config.json");
        if !candidate.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&candidate)
            .with_context(|| format!("read {}", candidate.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", candidate.display()))
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(vb: VarBuilder, size: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            bias: vb.get(size, "bias")?,
            eps,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    norm: LayerNorm,
    heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, cfg: &BertConfig) -> Result<Self> {
        let h = cfg.hidden_size;
        let self_vb = vb.pp("self");
        let out_vb = vb.pp("output");
        Ok(Self {
            query: candle_nn::linear(h, h, self_vb.pp("query"))?,
            key: candle_nn::linear(h, h, self_vb.pp("key"))?,
            value: candle_nn::linear(h, h, self_vb.pp("value"))?,
            output: candle_nn::linear(h, h, out_vb.pp("dense"))?,
            norm: LayerNorm::load(out_vb.pp("LayerNorm"), h, cfg.layer_norm_eps)?,
            heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        Ok(x.reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `bias` is the additive attention mask, shaped (batch, 1, 1, seq).
    fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        let q = self.split_heads(&self.query.forward(x)?, batch, seq)?;
        let k = self.split_heads(&self.key.forward(x)?, batch, seq)?;
        let v = self.split_heads(&self.value.forward(x)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let ctx = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.heads * self.head_dim))?;

        self.norm.forward(&(x + self.output.forward(&ctx)?)?)
    }
}

struct EncoderLayer {
    attention: Attention,
    up: Linear,
    down: Linear,
    norm: LayerNorm,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, cfg: &BertConfig) -> Result<Self> {
        Ok(Self {
            attention: Attention::load(vb.pp("attention"), cfg)?,
            up: candle_nn::linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            down: candle_nn::linear(
                cfg.intermediate_size,
                cfg.hidden_size,
                vb.pp("output").pp("dense"),
            )?,
            norm: LayerNorm::load(
                vb.pp("output").pp("LayerNorm"),
                cfg.hidden_size,
                cfg.layer_norm_eps,
            )?,
        })
    }

    fn forward(&self, x: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x, bias)?;
        let h = self.down.forward(&self.up.forward(&x)?.gelu_erf()?)?;
        self.norm.forward(&(x + h)?)
    }
}

struct BertEncoder {
    word_embeddings: Tensor,
    position_embeddings: Tensor,
    token_type_embeddings: Tensor,
    embedding_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    cfg: BertConfig,
    device: Device,
}

impl BertEncoder {
    fn load(path: &Path, cfg: BertConfig, device: Device) -> Result<Self> {
        // SAFETY: the weights file is treated as read-only for the model's lifetime.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? };

        let emb = vb.pp("embeddings");
        let word_embeddings = emb
            .pp("word_embeddings")
            .get((cfg.vocab_size, cfg.hidden_size), "weight")?;
        let position_embeddings = emb
            .pp("position_embeddings")
            .get((cfg.max_position_embeddings, cfg.hidden_size), "weight")?;
        let token_type_embeddings = emb
            .pp("token_type_embeddings")
            .get((cfg.type_vocab_size, cfg.hidden_size), "weight")?;
        let embedding_norm =
            LayerNorm::load(emb.pp("LayerNorm"), cfg.hidden_size, cfg.layer_norm_eps)?;

        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::load(vb.pp("encoder").pp("layer").pp(i.to_string()), &cfg))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embedding_norm,
            layers,
            cfg,
            device,
        })
    }

    /// Mean-pooled, unit-length sentence vectors for a batch of token id
    /// sequences. Sequences are right-padded with id 0.
    fn encode(&self, batch: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        let n = batch.len();
        let seq = batch.iter().map(Vec::len).max().unwrap_or(0);
        if n == 0 || seq == 0 {
            return Ok(vec![vec![0.0; self.cfg.hidden_size]; n]);
        }

        let mut ids = Vec::with_capacity(n * seq);
        let mut mask = Vec::with_capacity(n * seq);
        for row in batch {
            ids.extend(row.iter().copied());
            ids.extend(std::iter::repeat(0u32).take(seq - row.len()));
            mask.extend(std::iter::repeat(1.0f32).take(row.len()));
            mask.extend(std::iter::repeat(0.0f32).take(seq - row.len()));
        }

        let ids = Tensor::from_vec(ids, n * seq, &self.device)?;
        let mask = Tensor::from_vec(mask, (n, seq), &self.device)?;

        let words = self
            .word_embeddings
            .index_select(&ids, 0)?
            .reshape((n, seq, self.cfg.hidden_size))?;
        let positions = self.position_embeddings.narrow(0, 0, seq)?;
        let token_type = self.token_type_embeddings.get(0)?;

        let mut hidden = words
            .broadcast_add(&positions)?
            .broadcast_add(&token_type)?;
        hidden = self.embedding_norm.forward(&hidden)?;

        // 0 where attended, -10000 on padding.
        let bias = mask.affine(10_000.0, -10_000.0)?.unsqueeze(1)?.unsqueeze(1)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &bias)?;
        }

        let weights = mask.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
        let counts = weights.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;

        let mut rows = pooled.to_vec2::<f32>()?;
        for row in &mut rows {
            l2_normalize(row);
        }
        Ok(rows)
    }
}

pub struct MiniLmEmbeddingProvider {
    encoder: BertEncoder,
    tokenizer: tokenizers::Tokenizer,
    batch_size: usize,
}

impl MiniLmEmbeddingProvider {
    pub fn load(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        let cfg = BertConfig::for_model(model_path)?;
        let encoder = BertEncoder::load(model_path, cfg, Device::Cpu)?;
        let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("load tokenizer: {e}"))?;

        Ok(Self {
            encoder,
            tokenizer,
            batch_size: 32,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn token_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenize: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        let max = self.encoder.cfg.max_position_embeddings;
        if ids.len() > max {
            // Keep the closing [SEP].
            let last = ids[ids.len() - 1];
            ids.truncate(max - 1);
            ids.push(last);
        }
        Ok(ids)
    }
}

impl EmbeddingProvider for MiniLmEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let ids = self.token_ids(text)?;
        self.encoder
            .encode(&[ids])?
            .pop()
            .ok_or_else(|| anyhow!("encoder returned no rows"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let ids = chunk
                .iter()
                .map(|t| self.token_ids(t))
                .collect::<Result<Vec<_>>>()?;
            out.extend(self.encoder.encode(&ids)?);
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.encoder.cfg.hidden_size
    }

    fn name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }
}
