//! BERT encoders on candle
//!
//! Weights come from a Hugging Face Hub model id or a local directory with
//! `config.json`, `model.safetensors` (or `pytorch_model.bin`) and
//! `tokenizer.json`.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{LearnedScorer, SentenceEncoder, TokenEncoder};

/// Files making up a BERT checkpoint
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: Option<PathBuf>,
}

impl ModelFiles {
    /// Resolve a local directory, or download from the Hub
    pub fn resolve(source: &str) -> Result<Self> {
        let local = Path::new(source);
        if local.is_dir() {
            return Self::from_dir(local);
        }

        info!("Fetching model from Hugging Face Hub: {}", source);
        let api = Api::new().context("Failed to initialize Hugging Face Hub API")?;
        let repo = api.model(source.to_string());

        let config = repo
            .get("config.json")
            .with_context(|| format!("Failed to download config.json for {}", source))?;
        let weights = match repo.get("model.safetensors") {
            Ok(path) => path,
            Err(_) => repo.get("pytorch_model.bin").with_context(|| {
                format!(
                    "No model weights found for {} (tried model.safetensors and pytorch_model.bin)",
                    source
                )
            })?,
        };
        let tokenizer = repo.get("tokenizer.json").ok();

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let config = dir.join("config.json");
        if !config.exists() {
            return Err(anyhow!("config.json not found in {:?}", dir));
        }

        let weights = ["model.safetensors", "pytorch_model.bin"]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| {
                anyhow!(
                    "No model weights found in {:?} (tried model.safetensors and pytorch_model.bin)",
                    dir
                )
            })?;

        let tokenizer = Some(dir.join("tokenizer.json")).filter(|path| path.exists());

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }

    fn load_config(&self) -> Result<BertConfig> {
        let raw = std::fs::read_to_string(&self.config)
            .with_context(|| format!("Failed to read {:?}", self.config))?;
        serde_json::from_str(&raw).context("Failed to parse BERT config")
    }

    fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>> {
        let is_safetensors = self
            .weights
            .extension()
            .is_some_and(|ext| ext == "safetensors");

        if is_safetensors {
            // SAFETY: the checkpoint is mapped read-only and not modified while loaded
            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[&self.weights], DType::F32, device)
                    .context("Failed to load safetensors weights")?
            };
            Ok(vb)
        } else {
            VarBuilder::from_pth(&self.weights, DType::F32, device)
                .context("Failed to load pytorch weights")
        }
    }

    /// Load the tokenizer, borrowing it from `fallback` when the checkpoint has none
    fn load_tokenizer(&self, fallback: Option<&str>) -> Result<Tokenizer> {
        let path = match (&self.tokenizer, fallback) {
            (Some(path), _) => path.clone(),
            (None, Some(source)) => ModelFiles::resolve(source)?
                .tokenizer
                .ok_or_else(|| anyhow!("No tokenizer.json found for {}", source))?,
            (None, None) => return Err(anyhow!("Checkpoint has no tokenizer.json")),
        };

        let mut tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        tokenizer.with_padding(None);
        Ok(tokenizer)
    }
}

/// A BERT encoder returning last-layer hidden states
pub struct BertEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    max_positions: usize,
}

impl BertEncoder {
    /// Load from a Hub model id or a local directory
    pub fn load(source: &str, tokenizer_fallback: Option<&str>) -> Result<Self> {
        let files = ModelFiles::resolve(source)?;
        let device = Device::Cpu;
        let config = files.load_config()?;
        let vb = files.var_builder(&device)?;
        let tokenizer = files.load_tokenizer(tokenizer_fallback)?;
        Self::from_parts(&config, vb, tokenizer, device)
    }

    fn from_parts(
        config: &BertConfig,
        vb: VarBuilder<'static>,
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self> {
        let model =
            BertModel::load(vb, config).context("Failed to initialize BERT model from weights")?;

        info!(
            "Loaded BERT model: {} layers, {} hidden size",
            config.num_hidden_layers, config.hidden_size
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            max_positions: config.max_position_embeddings,
        })
    }

    fn tokenize<'s, E>(&self, input: E, add_special_tokens: bool) -> Result<(Vec<u32>, Vec<u32>)>
    where
        E: Into<tokenizers::EncodeInput<'s>>,
    {
        let encoding = self
            .tokenizer
            .encode(input, add_special_tokens)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let len = encoding.get_ids().len().min(self.max_positions);
        if len < encoding.get_ids().len() {
            debug!(
                "Truncating {} tokens to {}",
                encoding.get_ids().len(),
                self.max_positions
            );
        }
        Ok((
            encoding.get_ids()[..len].to_vec(),
            encoding.get_type_ids()[..len].to_vec(),
        ))
    }

    /// Hidden states `[seq_len, hidden_size]` for one encoded sequence
    fn hidden_states(&self, ids: &[u32], type_ids: &[u32]) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(anyhow!("Text produced no tokens"));
        }
        let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(type_ids, &self.device)?.unsqueeze(0)?;
        let hidden = self.model.forward(&input_ids, &token_type_ids, None)?;
        Ok(hidden.squeeze(0)?)
    }
}

impl SentenceEncoder for BertEncoder {
    /// Mean-pooled, L2-normalized embedding with special tokens included
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let (ids, type_ids) = self.tokenize(text, true)?;
        let pooled = self.hidden_states(&ids, &type_ids)?.mean(0)?;
        let norm = pooled.sqr()?.sum_all()?.sqrt()?;
        let normalized = pooled.broadcast_div(&norm.clamp(1e-12, f64::MAX)?)?;
        Ok(normalized.to_vec1::<f32>()?)
    }
}

impl TokenEncoder for BertEncoder {
    fn embed_tokens(&self, text: &str) -> Result<Vec<Vec<f32>>> {
        let (ids, type_ids) = self.tokenize(text, false)?;
        Ok(self.hidden_states(&ids, &type_ids)?.to_vec2::<f32>()?)
    }
}

/// BLEURT: a BERT encoder with a pooled single-logit regression head
///
/// The pair is encoded as `[CLS] reference [SEP] candidate [SEP]`.
pub struct BleurtRegressor {
    encoder: BertEncoder,
    pooler: Linear,
    head: Linear,
}

impl BleurtRegressor {
    /// Load from a Hub model id or a local checkpoint directory
    pub fn load(source: &str, tokenizer_fallback: Option<&str>) -> Result<Self> {
        let files = ModelFiles::resolve(source)?;
        let device = Device::Cpu;
        let config = files.load_config()?;
        let vb = files.var_builder(&device)?;
        let tokenizer = files.load_tokenizer(tokenizer_fallback)?;

        let hidden = config.hidden_size;
        let pooler = candle_nn::linear(hidden, hidden, vb.pp("bert.pooler.dense"))
            .context("Failed to load BLEURT pooler")?;
        let head = candle_nn::linear(hidden, 1, vb.pp("classifier"))
            .context("Failed to load BLEURT regression head")?;
        let encoder = BertEncoder::from_parts(&config, vb, tokenizer, device)?;

        Ok(Self {
            encoder,
            pooler,
            head,
        })
    }
}

impl LearnedScorer for BleurtRegressor {
    fn score(&self, reference: &str, candidate: &str) -> Result<f64> {
        let (ids, type_ids) = self.encoder.tokenize((reference, candidate), true)?;
        let hidden = self.encoder.hidden_states(&ids, &type_ids)?;
        let cls = hidden.i(0)?.unsqueeze(0)?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.head.forward(&pooled)?.flatten_all()?.to_vec1::<f32>()?;
        logits
            .first()
            .map(|&logit| logit as f64)
            .ok_or_else(|| anyhow!("BLEURT head returned no logits"))
    }
}
