// Dataset snapshot I/O: conversational records, split loading, cleaned output.

use anyhow::{Error, Result};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use mj_io::{expand_dirs, read_pathbuf_to_mem};

use crate::config::CheckSizeConfig;

/// One conversational turn of a record's `messages`-style column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// A dataset row, kept both as its raw JSONL line (re-emitted verbatim when
/// the record survives filtering) and as the extracted dedup key text.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub raw: String,
    pub key_text: String,
}

pub struct DatasetSplit {
    pub records: Vec<ConversationRecord>,
}

impl DatasetSplit {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn key_text(&self, idx: usize) -> &str {
        &self.records[idx].key_text
    }
}

/// Content of the first assistant turn; the record's dedup key.
pub fn assistant_text(turns: &[Turn]) -> Option<&str> {
    turns
        .iter()
        .find(|turn| turn.role == "assistant")
        .map(|turn| turn.content.as_str())
}

fn sanitize_repo_id(dataset: &str) -> String {
    dataset.replace('/', "--")
}

/// Resolve the local shard directory for a dataset split. A dataset that names
/// an existing directory is used as-is; otherwise it is treated as a hub
/// repository id and materialized under the snapshot dir on first use.
pub fn resolve_split_dir(dataset: &str, split: &str, snapshot_dir: &Path) -> Result<PathBuf, Error> {
    let as_path = PathBuf::from(dataset);
    if as_path.is_dir() {
        return Ok(as_path);
    }

    let split_dir = snapshot_dir.join(sanitize_repo_id(dataset)).join(split);
    if split_dir.is_dir() && dir_has_shards(&split_dir)? {
        return Ok(split_dir);
    }
    sync_split_snapshot(dataset, split, &split_dir)?;
    Ok(split_dir)
}

fn dir_has_shards(dir: &Path) -> Result<bool, Error> {
    let shards = expand_dirs(vec![dir.to_path_buf()], Some(vec![".jsonl", ".gz"].as_slice()))?;
    Ok(!shards.is_empty())
}

// Downloads the split's jsonl shards from the hub into the snapshot dir.
// Split membership follows the usual repo layouts: a `<split>/` subdirectory,
// a `-<split>-` shard-name token, or a `<split>-` filename prefix.
fn sync_split_snapshot(dataset: &str, split: &str, dest: &Path) -> Result<(), Error> {
    fs::create_dir_all(dest)?;

    let api = ApiBuilder::new()
        .with_progress(true)
        .with_retries(5)
        .build()?;
    let repo_api = api.repo(Repo::new(dataset.to_string(), RepoType::Dataset));

    println!("Reading remote file list for dataset {}", dataset);
    let info = repo_api.info()?;

    let split_tag = format!("{}/", split);
    let split_token = format!("-{}-", split);
    let split_prefix = format!("{}-", split);

    let mut fetched = 0usize;
    for sibling in info.siblings {
        let remote_path = sibling.rfilename;
        if !remote_path.ends_with(".jsonl") && !remote_path.ends_with(".jsonl.gz") {
            continue;
        }
        let file_name = Path::new(&remote_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&remote_path);
        let matches_split = remote_path.contains(&split_tag)
            || remote_path.contains(&split_token)
            || file_name.starts_with(&split_prefix)
            || file_name.starts_with(split);
        if !matches_split {
            continue;
        }

        println!("Downloading shard: {}", remote_path);
        let cached = repo_api.get(&remote_path)?;
        let target = dest.join(file_name);
        fs::copy(&cached, &target)?;
        fetched += 1;
    }

    if fetched == 0 {
        anyhow::bail!(
            "no jsonl shards found for split '{}' of dataset '{}'",
            split,
            dataset
        );
    }
    println!("Materialized {} shard(s) into {:?}", fetched, dest);
    Ok(())
}

/// Load a conversational split: every row's `column` is parsed as a list of
/// role/content turns and the first assistant turn becomes the dedup key.
/// Shards are visited in sorted path order so record indices are stable
/// across runs and across the cache side files.
pub fn load_conversation_split(
    dataset: &str,
    split: &str,
    column: &str,
    snapshot_dir: &Path,
) -> Result<DatasetSplit, Error> {
    let split_dir = resolve_split_dir(dataset, split, snapshot_dir)?;
    let mut shard_paths = expand_dirs(
        vec![split_dir.clone()],
        Some(vec![".jsonl", ".gz"].as_slice()),
    )?;
    shard_paths.sort();
    if shard_paths.is_empty() {
        anyhow::bail!("no shards found under {:?}", split_dir);
    }

    let mut records = Vec::new();
    let mut missing_assistant = 0usize;
    for shard_path in &shard_paths {
        let data = read_pathbuf_to_mem(shard_path)?;
        for line in data.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let json_obj: serde_json::Value = serde_json::from_str(&line)?;
            let turns_val = json_obj.get(column).ok_or_else(|| {
                anyhow::anyhow!("record missing column '{}' in {:?}", column, shard_path)
            })?;
            let turns: Vec<Turn> = serde_json::from_value(turns_val.clone())?;
            let key_text = match assistant_text(&turns) {
                Some(text) => text.to_string(),
                None => {
                    missing_assistant += 1;
                    String::new()
                }
            };
            records.push(ConversationRecord {
                raw: line,
                key_text,
            });
        }
    }

    if missing_assistant > 0 {
        eprintln!(
            "Warning: {} record(s) have no assistant turn and will never be flagged",
            missing_assistant
        );
    }
    println!(
        "Loaded {} records from {} shard(s)",
        records.len(),
        shard_paths.len()
    );
    Ok(DatasetSplit { records })
}

/// Load a plain string column (used by generate for the prompt batch).
pub fn load_string_column(
    dataset: &str,
    split: &str,
    column: &str,
    snapshot_dir: &Path,
) -> Result<Vec<String>, Error> {
    let split_dir = resolve_split_dir(dataset, split, snapshot_dir)?;
    let mut shard_paths = expand_dirs(
        vec![split_dir.clone()],
        Some(vec![".jsonl", ".gz"].as_slice()),
    )?;
    shard_paths.sort();

    let mut values = Vec::new();
    for shard_path in &shard_paths {
        let data = read_pathbuf_to_mem(shard_path)?;
        for line in data.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let json_obj: serde_json::Value = serde_json::from_str(&line)?;
            let value = json_obj
                .get(column)
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    anyhow::anyhow!("record missing string column '{}' in {:?}", column, shard_path)
                })?;
            values.push(value.to_string());
        }
    }
    Ok(values)
}

// Common function to write a cleaned split with duplicate records removed
pub fn write_cleaned_split(
    split: &DatasetSplit,
    duplicates: &HashSet<usize>,
    cleaned_output_dir: &Path,
    split_name: &str,
) -> Result<PathBuf, Error> {
    fs::create_dir_all(cleaned_output_dir)?;

    let cleaned_path = cleaned_output_dir.join(format!("{}.clean.jsonl", split_name));
    let mut output_file = BufWriter::new(File::create(&cleaned_path)?);

    let mut removed_count = 0usize;
    for (idx, record) in split.records.iter().enumerate() {
        if !duplicates.contains(&idx) {
            writeln!(output_file, "{}", record.raw)?;
        } else {
            removed_count += 1;
        }
    }

    output_file.flush()?;
    println!(
        "Created cleaned split: {:?} (removed {} duplicate records)",
        cleaned_path, removed_count
    );
    Ok(cleaned_path)
}

/*=================================================================
=                           CHECK SIZE                            =
=================================================================*/

pub fn split_exceeds_threshold(config: &CheckSizeConfig) -> Result<bool, Error> {
    let split_dir = resolve_split_dir(&config.dataset, &config.split, &config.snapshot_dir)?;
    let mut shard_paths = expand_dirs(
        vec![split_dir.clone()],
        Some(vec![".jsonl", ".gz"].as_slice()),
    )?;
    shard_paths.sort();

    let mut total_rows = 0usize;
    for shard_path in &shard_paths {
        let data = read_pathbuf_to_mem(shard_path)?;
        total_rows += data.lines().filter_map(|l| l.ok()).filter(|l| !l.trim().is_empty()).count();
    }

    crate::verbose_println!(
        config,
        "Split '{}' of '{}' holds {} rows (threshold {})",
        config.split,
        config.dataset,
        total_rows,
        config.threshold
    );
    Ok(total_rows > config.threshold)
}

// Prints exactly "true"/"false" so shell pipelines can gate on the output.
pub fn execute_check_size(config: &CheckSizeConfig) -> Result<(), Error> {
    config.validate()?;
    if split_exceeds_threshold(config)? {
        println!("true");
    } else {
        println!("false");
    }
    Ok(())
}
