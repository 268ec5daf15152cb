// YAML-backed configuration for each subcommand, overlaid by CLI flags.

use anyhow::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use mj_io::read_pathbuf_to_mem;

/*=================================================================
=                             DEDUP                               =
=================================================================*/

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    // Dataset identity
    #[serde(default)]
    pub dataset: String,
    #[serde(default = "default_train_split")]
    pub split: String,
    #[serde(default = "default_column")]
    pub column: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    // Minhash parameters
    #[serde(default = "default_minhash_threshold")]
    pub minhash_threshold: f64,
    #[serde(default = "default_num_perm")]
    pub num_perm: usize,
    #[serde(default)]
    pub num_bands: Option<usize>,
    #[serde(default)]
    pub band_size: Option<usize>,
    #[serde(default)]
    pub hash_seed: usize,

    // Confirmation scoring
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_use_stemmer")]
    pub use_stemmer: bool,

    // Intermediate caches
    #[serde(default = "default_use_cached")]
    pub use_cached_minhash: bool,
    #[serde(default = "default_minhash_cache_path")]
    pub cached_minhash_path: PathBuf,
    #[serde(default = "default_use_cached")]
    pub use_cached_dedup: bool,
    #[serde(default = "default_dedup_cache_path")]
    pub cached_dedup_path: PathBuf,

    // Output locations
    #[serde(default = "default_report_dir")]
    pub report_output_dir: PathBuf,
    #[serde(default = "default_cleaned_dir")]
    pub cleaned_output_dir: PathBuf,

    // Debug options
    #[serde(default)]
    pub verbose: bool,
}

fn default_train_split() -> String {
    "train".to_string()
}

fn default_column() -> String {
    "messages".to_string()
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("/tmp/ftprep/snapshots")
}

fn default_minhash_threshold() -> f64 {
    0.8
}

fn default_num_perm() -> usize {
    128
}

fn default_score_threshold() -> f64 {
    0.7
}

fn default_use_stemmer() -> bool {
    true
}

fn default_use_cached() -> bool {
    true
}

fn default_minhash_cache_path() -> PathBuf {
    PathBuf::from("/tmp/ftprep/minhashes.bin")
}

fn default_dedup_cache_path() -> PathBuf {
    PathBuf::from("/tmp/ftprep/duplicates.bin")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_cleaned_dir() -> PathBuf {
    PathBuf::from("cleaned")
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.dataset.is_empty() {
            anyhow::bail!("no dataset configured; set `dataset` in the config or pass --dataset");
        }
        if self.num_perm == 0 {
            anyhow::bail!("num_perm must be > 0");
        }
        if let (Some(b), Some(r)) = (self.num_bands, self.band_size) {
            if b * r != self.num_perm {
                anyhow::bail!(
                    "num_bands ({}) * band_size ({}) must equal num_perm ({})",
                    b,
                    r,
                    self.num_perm
                );
            }
        }
        Ok(())
    }
}

/*=================================================================
=                           CHECK SIZE                            =
=================================================================*/

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSizeConfig {
    #[serde(default)]
    pub dataset: String,
    #[serde(default = "default_eval_split")]
    pub split: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default)]
    pub threshold: usize,
    #[serde(default)]
    pub verbose: bool,
}

fn default_eval_split() -> String {
    "eval".to_string()
}

impl CheckSizeConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.dataset.is_empty() {
            anyhow::bail!("no dataset configured; set `dataset` in the config or pass --dataset");
        }
        Ok(())
    }
}

/*=================================================================
=                            GENERATE                             =
=================================================================*/

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    // Model identity
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub adapter_id: Option<String>,

    // Prompt batch
    #[serde(default)]
    pub dataset: String,
    #[serde(default = "default_eval_split")]
    pub split: String,
    #[serde(default = "default_prompt_column")]
    pub prompt_column: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    // Decoding parameters
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_eos_token")]
    pub eos_token: String,

    // Completion parsing
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    // Output
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    #[serde(default)]
    pub verbose: bool,
}

fn default_prompt_column() -> String {
    "prompt".to_string()
}

fn default_max_new_tokens() -> usize {
    256
}

fn default_seed() -> u64 {
    299792458
}

fn default_eos_token() -> String {
    "<|endoftext|>".to_string()
}

fn default_delimiter() -> String {
    "### Response:".to_string()
}

impl GenerateConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.model_id.is_empty() {
            anyhow::bail!("no model configured; set `model_id` in the config or pass --model-id");
        }
        if self.dataset.is_empty() {
            anyhow::bail!("no prompt dataset configured; set `dataset` or pass --dataset");
        }
        if self.delimiter.is_empty() {
            anyhow::bail!("delimiter must not be empty");
        }
        Ok(())
    }
}

/*=================================================================
=                            LOADING                              =
=================================================================*/

pub fn read_config<T: DeserializeOwned>(config_path: &PathBuf) -> Result<T, Error> {
    let contents = read_pathbuf_to_mem(config_path)?;
    let config: T = serde_yaml::from_reader(contents)?;
    Ok(config)
}

// Missing --config means "all serde defaults"; an empty mapping round-trips
// through the same deserialization path as a real file.
pub fn read_config_or_default<T: DeserializeOwned>(config_path: Option<&PathBuf>) -> Result<T, Error> {
    match config_path {
        Some(path) => read_config(path),
        None => Ok(serde_yaml::from_str("{}")?),
    }
}
