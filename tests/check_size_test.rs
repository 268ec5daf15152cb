use anyhow::Result;

use ftprep::config::CheckSizeConfig;
use ftprep::data::split_exceeds_threshold;

mod common;

fn check_size_config(env: &common::TestEnvironment, threshold: usize) -> CheckSizeConfig {
    CheckSizeConfig {
        dataset: env.split_dir.to_string_lossy().to_string(),
        split: "train".to_string(),
        snapshot_dir: env.split_dir.clone(),
        threshold,
        verbose: false,
    }
}

#[test]
fn test_threshold_comparison_is_strictly_greater() -> Result<()> {
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(
        &env.split_dir,
        "train-00000.jsonl",
        &["first reply", "second reply", "third reply"],
    )?;

    assert!(split_exceeds_threshold(&check_size_config(&env, 2))?);
    assert!(!split_exceeds_threshold(&check_size_config(&env, 3))?);
    assert!(!split_exceeds_threshold(&check_size_config(&env, 10))?);
    Ok(())
}

#[test]
fn test_rows_counted_across_shards() -> Result<()> {
    let env = common::TestEnvironment::new()?;
    common::write_conversation_shard(&env.split_dir, "train-00000.jsonl", &["a", "b"])?;
    common::write_conversation_shard(&env.split_dir, "train-00001.jsonl", &["c", "d", "e"])?;

    assert!(split_exceeds_threshold(&check_size_config(&env, 4))?);
    assert!(!split_exceeds_threshold(&check_size_config(&env, 5))?);
    Ok(())
}

#[test]
fn test_missing_dataset_is_rejected() {
    let config = CheckSizeConfig {
        dataset: String::new(),
        split: "eval".to_string(),
        snapshot_dir: std::path::PathBuf::from("/tmp/ftprep/snapshots"),
        threshold: 1,
        verbose: false,
    };
    assert!(config.validate().is_err());
}
