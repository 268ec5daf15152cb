// Near-duplicate detection pipeline: MinHash signatures -> LSH candidate
// retrieval -> pairwise ROUGE-L confirmation -> filtered output.

use anyhow::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use mj_io::{build_pbar, write_mem_to_pathbuf};
use ndarray::Array1;

use crate::config::DedupConfig;
use crate::data::{self, DatasetSplit};
use crate::minhash::{optimal_bands, LshIndex, MinHasher};
use crate::rouge::RougeScorer;
use crate::verbose_println;

/// One confirmed near-duplicate pair, as written to the report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub record_index: usize,
    pub duplicate_index: usize,
    pub rouge_l: f64,
}

pub fn results_filename() -> &'static str {
    "duplicate_results.jsonl"
}

pub fn execute_dedup(config: &DedupConfig) -> Result<(), Error> {
    config.validate()?;
    println!("Starting near-duplicate detection...");
    let start_main = Instant::now();

    let split = data::load_conversation_split(
        &config.dataset,
        &config.split,
        &config.column,
        &config.snapshot_dir,
    )?;
    if split.is_empty() {
        anyhow::bail!("split '{}' of '{}' is empty", config.split, config.dataset);
    }

    let (num_bands, band_size) = resolve_banding(config);
    println!(
        "Banding: {} bands x {} rows ({} permutations)",
        num_bands,
        band_size,
        num_bands * band_size
    );
    let hasher = MinHasher::new(num_bands, band_size, config.hash_seed);

    let signatures = load_or_build_signatures(config, &split, &hasher)?;
    let duplicates = load_or_find_duplicates(config, &split, &signatures, num_bands, band_size)?;

    println!("Found {} duplicate records.", duplicates.len());
    data::write_cleaned_split(
        &split,
        &duplicates,
        &config.cleaned_output_dir,
        &config.split,
    )?;
    println!("Cleaned split size: {}", split.len() - duplicates.len());
    println!(
        "Near-duplicate detection completed in {:?} seconds",
        start_main.elapsed().as_secs()
    );
    Ok(())
}

fn resolve_banding(config: &DedupConfig) -> (usize, usize) {
    match (config.num_bands, config.band_size) {
        (Some(num_bands), Some(band_size)) => (num_bands, band_size),
        _ => optimal_bands(config.minhash_threshold, config.num_perm),
    }
}

/*=================================================================
=                           SIGNATURES                            =
=================================================================*/

fn load_or_build_signatures(
    config: &DedupConfig,
    split: &DatasetSplit,
    hasher: &MinHasher,
) -> Result<Vec<Array1<u64>>, Error> {
    if config.use_cached_minhash {
        if let Some(signatures) = load_signature_cache(config, split.len(), hasher.num_perm())? {
            println!(
                "Loading MinHashes from {:?}",
                config.cached_minhash_path
            );
            return Ok(signatures);
        }
    }

    println!("Creating MinHashes");
    let pbar = build_pbar(split.len(), "Records");
    let signatures: Vec<Array1<u64>> = split
        .records
        .par_iter()
        .map(|record| {
            let signature = hasher.signature(&record.key_text);
            pbar.inc(1);
            signature
        })
        .collect();

    save_signature_cache(&config.cached_minhash_path, &signatures)?;
    Ok(signatures)
}

// Cache layout is the (index, signature) pair list, keyed only by file path.
// The one sanity check Rust forces on us: a pair list that no longer lines up
// with the dataset would panic at lookup, so treat it as a cache miss instead.
fn load_signature_cache(
    config: &DedupConfig,
    expected_len: usize,
    num_perm: usize,
) -> Result<Option<Vec<Array1<u64>>>, Error> {
    if !config.cached_minhash_path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&config.cached_minhash_path)?;
    let pairs: Vec<(usize, Vec<u64>)> = bincode::deserialize(&bytes)?;
    if pairs.len() != expected_len || pairs.iter().any(|(_, sig)| sig.len() != num_perm) {
        eprintln!(
            "Warning: stale MinHash cache at {:?} (shape mismatch); recomputing",
            config.cached_minhash_path
        );
        return Ok(None);
    }

    let mut signatures = vec![Array1::zeros(num_perm); expected_len];
    for (idx, sig) in pairs {
        if idx >= expected_len {
            eprintln!(
                "Warning: stale MinHash cache at {:?} (index out of range); recomputing",
                config.cached_minhash_path
            );
            return Ok(None);
        }
        signatures[idx] = Array1::from_vec(sig);
    }
    Ok(Some(signatures))
}

fn save_signature_cache(path: &Path, signatures: &[Array1<u64>]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let pairs: Vec<(usize, Vec<u64>)> = signatures
        .iter()
        .enumerate()
        .map(|(idx, sig)| (idx, sig.to_vec()))
        .collect();
    fs::write(path, bincode::serialize(&pairs)?)?;
    Ok(())
}

/*=================================================================
=                           DUPLICATES                            =
=================================================================*/

fn load_or_find_duplicates(
    config: &DedupConfig,
    split: &DatasetSplit,
    signatures: &[Array1<u64>],
    num_bands: usize,
    band_size: usize,
) -> Result<HashSet<usize>, Error> {
    if config.use_cached_dedup && config.cached_dedup_path.exists() {
        println!("Loading duplicates from {:?}", config.cached_dedup_path);
        let bytes = fs::read(&config.cached_dedup_path)?;
        let duplicates: HashSet<usize> = bincode::deserialize(&bytes)?;
        return Ok(duplicates);
    }

    println!("Inserting MinHashes into LSH");
    let index = LshIndex::new(num_bands, band_size);
    let pbar = build_pbar(signatures.len(), "Signatures");
    for (idx, signature) in signatures.iter().enumerate() {
        index.insert(idx, signature)?;
        pbar.inc(1);
    }
    verbose_println!(config, "LSH index holds {} buckets", index.len());

    println!("Scoring candidate pairs");
    let scorer = RougeScorer::new(config.use_stemmer);
    let pbar = build_pbar(signatures.len(), "Records");
    let pairs: Vec<Vec<DuplicatePair>> = signatures
        .par_iter()
        .enumerate()
        .map(|(idx, signature)| -> Result<Vec<DuplicatePair>, Error> {
            let mut found = Vec::new();
            for candidate in index.query(idx, signature)? {
                let score = scorer.rouge_l(split.key_text(idx), split.key_text(candidate));
                if score.fmeasure > config.score_threshold {
                    found.push(DuplicatePair {
                        record_index: idx,
                        duplicate_index: candidate,
                        rouge_l: score.fmeasure,
                    });
                }
            }
            pbar.inc(1);
            Ok(found)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    let pairs: Vec<DuplicatePair> = pairs.into_iter().flatten().collect();

    let duplicates: HashSet<usize> = pairs.iter().map(|pair| pair.duplicate_index).collect();

    save_duplicate_report(&pairs, &config.report_output_dir)?;
    if let Some(parent) = config.cached_dedup_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config.cached_dedup_path, bincode::serialize(&duplicates)?)?;

    Ok(duplicates)
}

pub fn save_duplicate_report(
    pairs: &[DuplicatePair],
    report_output_dir: &Path,
) -> Result<PathBuf, Error> {
    fs::create_dir_all(report_output_dir)?;
    let output_file = report_output_dir.join(results_filename());

    let mut output_bytes = Vec::new();
    for pair in pairs {
        output_bytes.extend(serde_json::to_vec(pair)?);
        output_bytes.push(b'\n');
    }
    write_mem_to_pathbuf(&output_bytes, &output_file)?;

    if pairs.is_empty() {
        println!("=== NO DUPLICATES DETECTED ===");
        println!("Empty results file saved to: {:?}", output_file);
    } else {
        println!("=== DUPLICATE SUMMARY ===");
        println!("Found {} confirmed pairs", pairs.len());
        println!("Results saved to: {:?}", output_file);
    }

    Ok(output_file)
}

pub fn load_duplicate_report(results_path: &PathBuf) -> Result<Vec<DuplicatePair>, Error> {
    use std::io::BufRead;
    let data = mj_io::read_pathbuf_to_mem(results_path)?;
    let mut pairs = Vec::new();
    for line in data.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            pairs.push(serde_json::from_str(&line)?);
        }
    }
    Ok(pairs)
}
