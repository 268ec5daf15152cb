use anyhow::Result;
use serde_json::json;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use ftprep::config::DedupConfig;

pub struct TestEnvironment {
    _temp_dir: TempDir, // Prefixed with _ to indicate it's kept for Drop cleanup
    pub split_dir: PathBuf,
    pub report_dir: PathBuf,
    pub cleaned_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub config_path: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let split_dir = temp_dir.path().join("data").join("train");
        let report_dir = temp_dir.path().join("reports");
        let cleaned_dir = temp_dir.path().join("cleaned");
        let cache_dir = temp_dir.path().join("caches");
        let config_path = temp_dir.path().join("config.yaml");

        fs::create_dir_all(&split_dir)?;
        fs::create_dir_all(&report_dir)?;
        fs::create_dir_all(&cleaned_dir)?;
        fs::create_dir_all(&cache_dir)?;

        Ok(TestEnvironment {
            _temp_dir: temp_dir,
            split_dir,
            report_dir,
            cleaned_dir,
            cache_dir,
            config_path,
        })
    }
}

/// Write one JSONL shard of conversational records, one per assistant reply.
pub fn write_conversation_shard(
    dir: &Path,
    shard_name: &str,
    assistant_replies: &[&str],
) -> Result<PathBuf> {
    let shard_path = dir.join(shard_name);
    let mut file = File::create(&shard_path)?;
    for (idx, reply) in assistant_replies.iter().enumerate() {
        let record = json!({
            "id": idx,
            "messages": [
                {"role": "user", "content": format!("question {}", idx)},
                {"role": "assistant", "content": reply},
            ],
        });
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
    }
    Ok(shard_path)
}

/// Write a shard of records that carry no assistant turn at all.
#[allow(dead_code)]
pub fn write_user_only_shard(dir: &Path, shard_name: &str, count: usize) -> Result<PathBuf> {
    let shard_path = dir.join(shard_name);
    let mut file = File::create(&shard_path)?;
    for idx in 0..count {
        let record = json!({
            "id": idx,
            "messages": [
                {"role": "user", "content": format!("unanswered question {}", idx)},
            ],
        });
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
    }
    Ok(shard_path)
}

/// A dedup config wired to the test environment's directories, with every
/// side file kept inside the tempdir so parallel tests never share caches.
#[allow(dead_code)]
pub fn default_dedup_config(env: &TestEnvironment) -> DedupConfig {
    DedupConfig {
        dataset: env.split_dir.to_string_lossy().to_string(),
        split: "train".to_string(),
        column: "messages".to_string(),
        snapshot_dir: env.split_dir.clone(),
        minhash_threshold: 0.8,
        num_perm: 128,
        num_bands: None,
        band_size: None,
        hash_seed: 0,
        score_threshold: 0.7,
        use_stemmer: true,
        use_cached_minhash: true,
        cached_minhash_path: env.cache_dir.join("minhashes.bin"),
        use_cached_dedup: true,
        cached_dedup_path: env.cache_dir.join("duplicates.bin"),
        report_output_dir: env.report_dir.clone(),
        cleaned_output_dir: env.cleaned_dir.clone(),
        verbose: false,
    }
}

#[allow(dead_code)]
pub fn cleaned_lines(env: &TestEnvironment) -> Result<Vec<String>> {
    let cleaned_path = env.cleaned_dir.join("train.clean.jsonl");
    if !cleaned_path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(cleaned_path)?;
    Ok(contents.lines().map(|line| line.to_string()).collect())
}

#[allow(dead_code)]
pub fn assistant_reply_of(line: &str) -> Result<String> {
    let record: serde_json::Value = serde_json::from_str(line)?;
    let content = record["messages"]
        .as_array()
        .and_then(|turns| {
            turns
                .iter()
                .find(|turn| turn["role"].as_str() == Some("assistant"))
        })
        .and_then(|turn| turn["content"].as_str())
        .unwrap_or_default();
    Ok(content.to_string())
}
