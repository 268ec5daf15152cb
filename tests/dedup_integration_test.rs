use anyhow::Result;

use ftprep::dedup::{execute_dedup, load_duplicate_report, results_filename};

mod common;

#[test]
fn test_exact_duplicates_are_both_flagged() -> Result<()> {
    // Two records share an identical assistant reply; one is unrelated.
    // Every confirmed partner lands in the duplicate set, so both members
    // of the pair are dropped and only the unrelated record survives.
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &[
            "The mitochondria is the powerhouse of the cell and produces ATP.",
            "The mitochondria is the powerhouse of the cell and produces ATP.",
            "Paris welcomes millions who visit its museums, cafes, boulevards each spring.",
        ],
    )?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;

    let lines = common::cleaned_lines(&env)?;
    assert_eq!(lines.len(), 1, "both duplicate members should be removed");
    assert!(common::assistant_reply_of(&lines[0])?.contains("Paris"));

    let pairs = load_duplicate_report(&env.report_dir.join(results_filename()))?;
    assert_eq!(pairs.len(), 2, "pair should be reported in both directions");
    assert!(pairs.iter().all(|p| p.rouge_l > 0.99));
    assert!(pairs
        .iter()
        .any(|p| p.record_index == 0 && p.duplicate_index == 1));
    assert!(pairs
        .iter()
        .any(|p| p.record_index == 1 && p.duplicate_index == 0));
    Ok(())
}

#[test]
fn test_punctuation_variants_are_duplicates() -> Result<()> {
    // Cleaning lowercases and strips punctuation before hashing, so these two
    // produce identical word sets (guaranteed LSH collision) and near-identical
    // token sequences (ROUGE-L above threshold).
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &[
            "The capital of France is Paris, and everyone knows it well.",
            "the capital of france is paris and everyone knows it well",
            "Sourdough bread needs a mature starter plus patience during cold proofing.",
        ],
    )?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;

    let lines = common::cleaned_lines(&env)?;
    assert_eq!(lines.len(), 1);
    assert!(common::assistant_reply_of(&lines[0])?.contains("Sourdough"));
    Ok(())
}

#[test]
fn test_candidates_below_score_threshold_survive() -> Result<()> {
    // Identical word sets guarantee the pair surfaces as an LSH candidate,
    // but the reversed ordering collapses the LCS to a single token, so
    // ROUGE-L confirmation rejects it and nothing is filtered.
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &[
            "one two three four five six seven eight nine ten",
            "ten nine eight seven six five four three two one",
        ],
    )?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;

    let lines = common::cleaned_lines(&env)?;
    assert_eq!(lines.len(), 2, "low-ROUGE candidates must not be filtered");

    let pairs = load_duplicate_report(&env.report_dir.join(results_filename()))?;
    assert!(pairs.is_empty());
    Ok(())
}

#[test]
fn test_records_without_assistant_turn_never_flagged() -> Result<()> {
    // Records with no assistant turn share an empty key text. Their fill-value
    // signatures all collide in the index, but an empty ROUGE side scores zero,
    // so every one of them survives.
    let env = common::TestEnvironment::new()?;
    common::write_user_only_shard(&env.split_dir, "train-00000.jsonl", 3)?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;

    let lines = common::cleaned_lines(&env)?;
    assert_eq!(lines.len(), 3);
    Ok(())
}

#[test]
fn test_cache_files_written_and_reused() -> Result<()> {
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &[
            "Rust enforces memory safety through ownership and borrowing rules.",
            "Rust enforces memory safety through ownership and borrowing rules.",
            "Tokyo is the most populous metropolitan area in the entire world.",
        ],
    )?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;
    assert!(config.cached_minhash_path.exists());
    assert!(config.cached_dedup_path.exists());
    let first_run = common::cleaned_lines(&env)?;

    // Second run takes the cached path end-to-end and must agree.
    execute_dedup(&config)?;
    let second_run = common::cleaned_lines(&env)?;
    assert_eq!(first_run, second_run);
    Ok(())
}

#[test]
fn test_stale_minhash_cache_recomputed() -> Result<()> {
    // Growing the dataset invalidates the signature cache (shape check), while
    // the duplicate-set cache is keyed only by path and gets reused as-is.
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &[
            "Photosynthesis converts light energy into chemical energy in plants.",
            "Photosynthesis converts light energy into chemical energy in plants.",
            "Octopuses have three hearts and blue copper-based blood.",
        ],
    )?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;
    assert_eq!(common::cleaned_lines(&env)?.len(), 1);

    // One more shard appears; the cached duplicate set {0, 1} still applies.
    common::write_conversation_shard(
        &env.split_dir,
        "train-00001.jsonl",
        &["Volcanic lightning forms inside ash plumes during large eruptions."],
    )?;
    execute_dedup(&config)?;
    assert_eq!(common::cleaned_lines(&env)?.len(), 2);
    Ok(())
}

#[test]
fn test_multi_shard_indices_are_stable() -> Result<()> {
    // Shards are visited in sorted path order, so the duplicate pair spans
    // shard boundaries with global indices.
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &["Honey never spoils because its low moisture stops microbial growth."],
    )?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00001.jsonl",
        &[
            "Glaciers store roughly two thirds of the planet's fresh water supply.",
            "Honey never spoils because its low moisture stops microbial growth.",
        ],
    )?;

    let config = common::default_dedup_config(&env);
    execute_dedup(&config)?;

    let pairs = load_duplicate_report(&env.report_dir.join(results_filename()))?;
    assert!(pairs
        .iter()
        .any(|p| p.record_index == 0 && p.duplicate_index == 2));

    let lines = common::cleaned_lines(&env)?;
    assert_eq!(lines.len(), 1);
    assert!(common::assistant_reply_of(&lines[0])?.contains("Glaciers"));
    Ok(())
}

#[test]
fn test_yaml_config_roundtrip() -> Result<()> {
    let env = common::TestEnvironment::new()?;
    let yaml = format!(
        "dataset: {}\nminhash_threshold: 0.6\nscore_threshold: 0.5\nuse_stemmer: false\n",
        env.split_dir.to_string_lossy()
    );
    std::fs::write(&env.config_path, yaml)?;

    let config: ftprep::config::DedupConfig = ftprep::config::read_config(&env.config_path)?;
    assert_eq!(config.dataset, env.split_dir.to_string_lossy());
    assert!((config.minhash_threshold - 0.6).abs() < 1e-9);
    assert!((config.score_threshold - 0.5).abs() < 1e-9);
    assert!(!config.use_stemmer);
    // Defaults still fill the unspecified fields.
    assert_eq!(config.num_perm, 128);
    assert_eq!(config.split, "train");
    Ok(())
}
