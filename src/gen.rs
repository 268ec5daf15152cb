// Local inference from a fine-tuned causal LM: base weights plus a merged
// LoRA adapter, batched prompt generation, delimiter-parsed completions.

use anyhow::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::qwen2::{Config as ModelConfig, ModelForCausalLM};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokenizers::Tokenizer;

use mj_io::build_pbar;

use crate::config::GenerateConfig;
use crate::data;
use crate::verbose_println;

struct ModelAssets {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

fn hub_repo(repo_id: &str) -> Result<ApiRepo, Error> {
    let api = ApiBuilder::new()
        .with_progress(true)
        .with_retries(5)
        .build()?;
    Ok(api.repo(Repo::new(repo_id.to_string(), RepoType::Model)))
}

// Sharded checkpoints list their files in the safetensors index; single-file
// checkpoints just ship model.safetensors.
fn hub_weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>, Error> {
    match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let index: serde_json::Value = serde_json::from_reader(File::open(index_path)?)?;
            let weight_map = index
                .get("weight_map")
                .and_then(|v| v.as_object())
                .ok_or_else(|| anyhow::anyhow!("malformed safetensors index: no weight_map"))?;
            let mut shard_names = HashSet::new();
            for value in weight_map.values() {
                if let Some(file) = value.as_str() {
                    shard_names.insert(file.to_string());
                }
            }
            let mut files = Vec::new();
            for name in shard_names {
                files.push(repo.get(&name)?);
            }
            Ok(files)
        }
        Err(_) => Ok(vec![repo.get("model.safetensors")?]),
    }
}

fn fetch_model_assets(model_id: &str) -> Result<ModelAssets, Error> {
    let as_path = PathBuf::from(model_id);
    if as_path.is_dir() {
        let mut weights: Vec<PathBuf> = fs::read_dir(&as_path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().and_then(|ext| ext.to_str()) == Some("safetensors")
            })
            .collect();
        weights.sort();
        if weights.is_empty() {
            anyhow::bail!("no safetensors weights found in {:?}", as_path);
        }
        return Ok(ModelAssets {
            config: as_path.join("config.json"),
            tokenizer: as_path.join("tokenizer.json"),
            weights,
        });
    }

    let repo = hub_repo(model_id)?;
    Ok(ModelAssets {
        config: repo.get("config.json")?,
        tokenizer: repo.get("tokenizer.json")?,
        weights: hub_weight_files(&repo)?,
    })
}

fn load_weight_files(
    weights: &[PathBuf],
    device: &Device,
) -> Result<HashMap<String, Tensor>, Error> {
    let mut tensors = HashMap::new();
    for path in weights {
        tensors.extend(candle_core::safetensors::load(path, device)?);
    }
    Ok(tensors)
}

/*=================================================================
=                         ADAPTER MERGE                           =
=================================================================*/

#[derive(Debug, Deserialize)]
struct AdapterConfig {
    r: usize,
    lora_alpha: f64,
}

/// Map an adapter's `lora_A` tensor name to the base weight it patches and
/// its paired `lora_B` name. PEFT prefixes adapter tensors with
/// `base_model.model.`.
fn base_weight_name(lora_a_name: &str) -> Option<(String, String)> {
    let suffix = ".lora_A.weight";
    if !lora_a_name.ends_with(suffix) {
        return None;
    }
    let stripped = lora_a_name
        .strip_prefix("base_model.model.")
        .unwrap_or(lora_a_name);
    let module = &stripped[..stripped.len() - suffix.len()];
    let base = format!("{}.weight", module);
    let lora_b = lora_a_name.replace(".lora_A.", ".lora_B.");
    Some((base, lora_b))
}

/// Weight-level equivalent of merge-and-unload: every adapted module's base
/// weight gains `(alpha / r) * B @ A`.
fn merge_adapter(
    tensors: &mut HashMap<String, Tensor>,
    adapter_id: &str,
    device: &Device,
) -> Result<usize, Error> {
    let (adapter_weights, adapter_config) = fetch_adapter_assets(adapter_id)?;
    let adapter_cfg: AdapterConfig = serde_json::from_reader(File::open(&adapter_config)?)?;
    if adapter_cfg.r == 0 {
        anyhow::bail!("adapter rank must be > 0");
    }
    let scaling = adapter_cfg.lora_alpha / adapter_cfg.r as f64;

    let adapter_tensors = candle_core::safetensors::load(&adapter_weights, device)?;
    let mut merged_count = 0usize;
    for (name, lora_a) in &adapter_tensors {
        let Some((base_name, lora_b_name)) = base_weight_name(name) else {
            continue;
        };
        let lora_b = adapter_tensors.get(&lora_b_name).ok_or_else(|| {
            anyhow::anyhow!("adapter tensor {} has no matching lora_B", name)
        })?;
        let base = tensors.get(&base_name).ok_or_else(|| {
            anyhow::anyhow!("adapter patches unknown base weight {}", base_name)
        })?;

        let delta = lora_b
            .to_dtype(DType::F32)?
            .matmul(&lora_a.to_dtype(DType::F32)?)?
            .affine(scaling, 0.0)?;
        let merged = base.to_dtype(DType::F32)?.add(&delta)?;
        tensors.insert(base_name, merged);
        merged_count += 1;
    }

    if merged_count == 0 {
        anyhow::bail!("adapter {} contained no lora_A/lora_B pairs", adapter_id);
    }
    Ok(merged_count)
}

fn fetch_adapter_assets(adapter_id: &str) -> Result<(PathBuf, PathBuf), Error> {
    let as_path = PathBuf::from(adapter_id);
    if as_path.is_dir() {
        return Ok((
            as_path.join("adapter_model.safetensors"),
            as_path.join("adapter_config.json"),
        ));
    }
    let repo = hub_repo(adapter_id)?;
    Ok((
        repo.get("adapter_model.safetensors")?,
        repo.get("adapter_config.json")?,
    ))
}

/*=================================================================
=                          GENERATION                             =
=================================================================*/

pub struct TextGenerator {
    model: ModelForCausalLM,
    tokenizer: Tokenizer,
    logits_processor: LogitsProcessor,
    device: Device,
    eos_token_id: Option<u32>,
    max_new_tokens: usize,
}

impl TextGenerator {
    /// Decode loop in the usual prefill-then-incremental shape: the whole
    /// prompt feeds the first forward pass, every later pass sees one token
    /// and reuses the model's KV cache.
    pub fn generate(&mut self, prompt: &str) -> Result<String, Error> {
        self.model.clear_kv_cache();
        let encoding = self.tokenizer.encode(prompt, true).map_err(Error::msg)?;
        let mut tokens: Vec<u32> = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            anyhow::bail!("prompt tokenized to zero tokens");
        }

        for index in 0..self.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, start_pos)?;
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let next_token = self.logits_processor.sample(&logits)?;
            if Some(next_token) == self.eos_token_id {
                break;
            }
            tokens.push(next_token);
        }

        let raw_output = self.tokenizer.decode(&tokens, true).map_err(Error::msg)?;
        Ok(raw_output)
    }
}

/// Parse the completion span out of a decoded output: everything after the
/// prompt, then the segment between the first and second delimiter occurrence
/// (or the tail when the delimiter appears once), trimmed. `None` when the
/// output does not contain the prompt or the delimiter.
pub fn extract_completion(raw_output: &str, prompt: &str, delimiter: &str) -> Option<String> {
    let (_, after_prompt) = raw_output.split_once(prompt)?;
    let completion = after_prompt.split(delimiter).nth(1)?;
    Some(completion.trim().to_string())
}

pub fn execute_generate(config: &GenerateConfig) -> Result<(), Error> {
    config.validate()?;
    let device = Device::Cpu;

    println!("Loading model {}", config.model_id);
    let assets = fetch_model_assets(&config.model_id)?;
    let tokenizer = Tokenizer::from_file(&assets.tokenizer).map_err(Error::msg)?;
    let model_config: ModelConfig = serde_json::from_slice(&fs::read(&assets.config)?)?;
    let mut tensors = load_weight_files(&assets.weights, &device)?;

    if let Some(adapter_id) = &config.adapter_id {
        println!("Merging adapter {}", adapter_id);
        let merged = merge_adapter(&mut tensors, adapter_id, &device)?;
        println!("Merged {} adapted weight(s)", merged);
    }

    let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
    let model = ModelForCausalLM::new(&model_config, vb)?;
    let eos_token_id = tokenizer.token_to_id(&config.eos_token);
    if eos_token_id.is_none() {
        eprintln!(
            "Warning: eos token {:?} not in tokenizer vocab; generation stops on length only",
            config.eos_token
        );
    }

    let mut generator = TextGenerator {
        model,
        tokenizer,
        logits_processor: LogitsProcessor::new(config.seed, config.temperature, config.top_p),
        device,
        eos_token_id,
        max_new_tokens: config.max_new_tokens,
    };

    let prompts = data::load_string_column(
        &config.dataset,
        &config.split,
        &config.prompt_column,
        &config.snapshot_dir,
    )?;
    println!("Generating for {} prompt(s)", prompts.len());

    let pbar = build_pbar(prompts.len(), "Prompts");
    let mut outputs: Vec<Option<String>> = Vec::with_capacity(prompts.len());
    for prompt in &prompts {
        let raw_output = generator.generate(prompt)?;
        verbose_println!(config, "--- raw output ---\n{}", raw_output);
        let parsed = extract_completion(&raw_output, prompt, &config.delimiter);
        if parsed.is_none() {
            eprintln!("Malformed generation output, raw text follows:");
            eprintln!("{}", raw_output);
        }
        outputs.push(parsed);
        pbar.inc(1);
    }

    emit_outputs(config, &prompts, &outputs)?;
    Ok(())
}

fn emit_outputs(
    config: &GenerateConfig,
    prompts: &[String],
    outputs: &[Option<String>],
) -> Result<(), Error> {
    match &config.output_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut writer = BufWriter::new(File::create(path)?);
            for (prompt, output) in prompts.iter().zip(outputs.iter()) {
                let row = serde_json::json!({
                    "prompt": prompt,
                    "completion": output,
                });
                writeln!(writer, "{}", serde_json::to_string(&row)?)?;
            }
            writer.flush()?;
            println!("Wrote {} completion(s) to {:?}", outputs.len(), path);
        }
        None => {
            for output in outputs {
                println!("{}", output.as_deref().unwrap_or(""));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_completion_basic() {
        let raw = "Question: 2+2?\n### Response: 4 ### Response: junk";
        let out = extract_completion(raw, "Question: 2+2?", "### Response:");
        assert_eq!(out.as_deref(), Some("4"));
    }

    #[test]
    fn test_extract_completion_single_delimiter_takes_tail() {
        let raw = "PROMPT### Response: the answer is 42";
        let out = extract_completion(raw, "PROMPT", "### Response:");
        assert_eq!(out.as_deref(), Some("the answer is 42"));
    }

    #[test]
    fn test_extract_completion_missing_delimiter() {
        let raw = "PROMPT and then rambling with no marker";
        assert_eq!(extract_completion(raw, "PROMPT", "### Response:"), None);
    }

    #[test]
    fn test_extract_completion_missing_prompt() {
        let raw = "entirely unrelated decoded text";
        assert_eq!(extract_completion(raw, "PROMPT", "### Response:"), None);
    }

    #[test]
    fn test_base_weight_name_mapping() {
        let (base, lora_b) = base_weight_name(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
        )
        .unwrap();
        assert_eq!(base, "model.layers.0.self_attn.q_proj.weight");
        assert_eq!(
            lora_b,
            "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight"
        );
    }

    #[test]
    fn test_base_weight_name_ignores_non_lora_tensors() {
        assert!(base_weight_name("model.embed_tokens.weight").is_none());
        assert!(base_weight_name("base_model.model.x.lora_B.weight").is_none());
    }
}
