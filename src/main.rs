// External crates
use anyhow::{Error, Result};
use clap::{Parser, Subcommand};

// Standard library
use std::path::PathBuf;

// Internal crate imports
use ftprep::config::{
    read_config_or_default, CheckSizeConfig, DedupConfig, GenerateConfig,
};
use ftprep::{execute_check_size, execute_dedup, execute_generate, execute_review};

/*=================================================================
=                                  ARGS                           =
=================================================================*/

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct ArgParser {
    #[clap(subcommand)]
    command: Commands,

    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare a dataset split's row count against a threshold, printing
    /// "true" or "false".
    CheckSize {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        dataset: Option<String>,

        #[arg(long)]
        split: Option<String>,

        #[arg(long)]
        threshold: Option<usize>,
    },

    /// Filter near-duplicate conversational records out of a dataset split.
    Dedup {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        dataset: Option<String>,

        #[arg(long)]
        split: Option<String>,

        #[arg(long, help = "Record column holding the role/content turns")]
        column: Option<String>,

        #[arg(long)]
        minhash_threshold: Option<f64>,

        #[arg(long)]
        num_perm: Option<usize>,

        #[arg(long)]
        score_threshold: Option<f64>,

        #[arg(long, help = "Recompute MinHashes even when a cache file exists")]
        no_cached_minhash: bool,

        #[arg(long, help = "Recompute duplicates even when a cache file exists")]
        no_cached_dedup: bool,

        #[arg(long)]
        verbose: bool,
    },

    /// Step through confirmed duplicate pairs from a previous dedup run.
    Review {
        #[arg(required = true, long)]
        config: PathBuf,

        #[arg(long)]
        results_file: Option<PathBuf>,

        #[arg(long, help = "Step through pairs one by one, waiting for Enter between each")]
        step: bool,

        #[arg(long, help = "Display full record texts (default: truncate at 25 lines)")]
        full: bool,
    },

    /// Generate completions for a prompt batch from a fine-tuned model.
    Generate {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        model_id: Option<String>,

        #[arg(long, help = "LoRA adapter repository id or local directory")]
        adapter: Option<String>,

        #[arg(long)]
        dataset: Option<String>,

        #[arg(long)]
        split: Option<String>,

        #[arg(long)]
        max_new_tokens: Option<usize>,

        #[arg(long)]
        output_path: Option<PathBuf>,

        #[arg(long)]
        verbose: bool,
    },
}

/*=================================================================
=                         CONFIG OVERLAY                          =
=================================================================*/

fn check_size_config(
    config: Option<&PathBuf>,
    dataset: Option<&String>,
    split: Option<&String>,
    threshold: Option<usize>,
) -> Result<CheckSizeConfig, Error> {
    let mut cfg: CheckSizeConfig = read_config_or_default(config)?;
    if let Some(dataset) = dataset {
        cfg.dataset = dataset.clone();
    }
    if let Some(split) = split {
        cfg.split = split.clone();
    }
    if let Some(threshold) = threshold {
        cfg.threshold = threshold;
    }
    Ok(cfg)
}

#[allow(clippy::too_many_arguments)]
fn dedup_config(
    config: Option<&PathBuf>,
    dataset: Option<&String>,
    split: Option<&String>,
    column: Option<&String>,
    minhash_threshold: Option<f64>,
    num_perm: Option<usize>,
    score_threshold: Option<f64>,
    no_cached_minhash: bool,
    no_cached_dedup: bool,
    verbose: bool,
) -> Result<DedupConfig, Error> {
    let mut cfg: DedupConfig = read_config_or_default(config)?;
    if let Some(dataset) = dataset {
        cfg.dataset = dataset.clone();
    }
    if let Some(split) = split {
        cfg.split = split.clone();
    }
    if let Some(column) = column {
        cfg.column = column.clone();
    }
    if let Some(minhash_threshold) = minhash_threshold {
        cfg.minhash_threshold = minhash_threshold;
    }
    if let Some(num_perm) = num_perm {
        cfg.num_perm = num_perm;
    }
    if let Some(score_threshold) = score_threshold {
        cfg.score_threshold = score_threshold;
    }
    if no_cached_minhash {
        cfg.use_cached_minhash = false;
    }
    if no_cached_dedup {
        cfg.use_cached_dedup = false;
    }
    if verbose {
        cfg.verbose = true;
    }
    Ok(cfg)
}

fn generate_config(
    config: Option<&PathBuf>,
    model_id: Option<&String>,
    adapter: Option<&String>,
    dataset: Option<&String>,
    split: Option<&String>,
    max_new_tokens: Option<usize>,
    output_path: Option<&PathBuf>,
    verbose: bool,
) -> Result<GenerateConfig, Error> {
    let mut cfg: GenerateConfig = read_config_or_default(config)?;
    if let Some(model_id) = model_id {
        cfg.model_id = model_id.clone();
    }
    if let Some(adapter) = adapter {
        cfg.adapter_id = Some(adapter.clone());
    }
    if let Some(dataset) = dataset {
        cfg.dataset = dataset.clone();
    }
    if let Some(split) = split {
        cfg.split = split.clone();
    }
    if let Some(max_new_tokens) = max_new_tokens {
        cfg.max_new_tokens = max_new_tokens;
    }
    if let Some(output_path) = output_path {
        cfg.output_path = Some(output_path.clone());
    }
    if verbose {
        cfg.verbose = true;
    }
    Ok(cfg)
}

/*=================================================================
=                                 MAIN                            =
=================================================================*/

fn main() {
    let args = ArgParser::parse();
    let threads = args.threads;
    if threads != 0 {
        std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
    }

    let result: Result<(), Error> = match &args.command {
        Commands::CheckSize {
            config,
            dataset,
            split,
            threshold,
        } => check_size_config(config.as_ref(), dataset.as_ref(), split.as_ref(), *threshold)
            .and_then(|cfg| execute_check_size(&cfg)),

        Commands::Dedup {
            config,
            dataset,
            split,
            column,
            minhash_threshold,
            num_perm,
            score_threshold,
            no_cached_minhash,
            no_cached_dedup,
            verbose,
        } => dedup_config(
            config.as_ref(),
            dataset.as_ref(),
            split.as_ref(),
            column.as_ref(),
            *minhash_threshold,
            *num_perm,
            *score_threshold,
            *no_cached_minhash,
            *no_cached_dedup,
            *verbose,
        )
        .and_then(|cfg| execute_dedup(&cfg)),

        Commands::Review {
            config,
            results_file,
            step,
            full,
        } => {
            let cfg: Result<DedupConfig, Error> = ftprep::config::read_config(config);
            cfg.and_then(|cfg| execute_review(&cfg, results_file.as_ref(), *step, *full))
        }

        Commands::Generate {
            config,
            model_id,
            adapter,
            dataset,
            split,
            max_new_tokens,
            output_path,
            verbose,
        } => generate_config(
            config.as_ref(),
            model_id.as_ref(),
            adapter.as_ref(),
            dataset.as_ref(),
            split.as_ref(),
            *max_new_tokens,
            output_path.as_ref(),
            *verbose,
        )
        .and_then(|cfg| execute_generate(&cfg)),
    };
    result.unwrap()
}
