// Interactive review of confirmed duplicate pairs from a dedup run.

use anyhow::{Error, Result};
use std::io;
use std::path::PathBuf;

use crate::config::DedupConfig;
use crate::data;
use crate::dedup::{load_duplicate_report, results_filename, DuplicatePair};
use crate::rouge::RougeScorer;

pub fn execute_review(
    config: &DedupConfig,
    results_file: Option<&PathBuf>,
    step: bool,
    full: bool,
) -> Result<(), Error> {
    config.validate()?;
    println!("=== DUPLICATE REVIEW ===");

    let results_path = match results_file {
        Some(path) => path.clone(),
        None => config.report_output_dir.join(results_filename()),
    };

    if !results_path.exists() {
        println!("No duplicate results file found at: {:?}", results_path);
        println!("Run dedup first, or specify --results-file");
        return Ok(());
    }

    println!("Loading duplicate results from: {:?}", results_path);
    let pairs = load_duplicate_report(&results_path)?;

    if pairs.is_empty() {
        println!("No duplicates found in results file.");
        return Ok(());
    }

    println!("Found {} duplicate pairs to review\n", pairs.len());

    let split = data::load_conversation_split(
        &config.dataset,
        &config.split,
        &config.column,
        &config.snapshot_dir,
    )?;
    let scorer = RougeScorer::new(config.use_stemmer);

    for (idx, pair) in pairs.iter().enumerate() {
        if step && idx > 0 {
            println!("\nPress Enter to continue to next duplicate pair...");
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            // Clear the screen
            print!("\x1B[2J\x1B[1;1H");
        }

        println!("{}", "=".repeat(80));
        println!("DUPLICATE #{} of {}", idx + 1, pairs.len());
        println!("{}", "=".repeat(80));

        display_duplicate_pair(pair, &split, &scorer, full)?;
        println!();
    }

    println!("=== REVIEW COMPLETE ===");
    Ok(())
}

fn display_duplicate_pair(
    pair: &DuplicatePair,
    split: &data::DatasetSplit,
    scorer: &RougeScorer,
    full: bool,
) -> Result<(), Error> {
    println!("RECORD:     {}", pair.record_index);
    println!("DUPLICATE:  {}", pair.duplicate_index);
    println!("ROUGE-L F:  {:.3}", pair.rouge_l);
    println!();

    let record_text = record_text_or_placeholder(split, pair.record_index);
    let duplicate_text = record_text_or_placeholder(split, pair.duplicate_index);

    println!("RECORD TEXT (index {}):", pair.record_index);
    println!("   \"{}\"", maybe_truncate(record_text, full));
    println!();
    println!("DUPLICATE TEXT (index {}):", pair.duplicate_index);
    println!("   \"{}\"", maybe_truncate(duplicate_text, full));
    println!();

    // The report carries the score from detection time; recompute so a changed
    // stemmer setting or dataset revision is visible during review.
    if pair.record_index < split.len() && pair.duplicate_index < split.len() {
        let score = scorer.rouge_l(
            split.key_text(pair.record_index),
            split.key_text(pair.duplicate_index),
        );
        if (score.fmeasure - pair.rouge_l).abs() > 1e-6 {
            println!("Note: recomputed ROUGE-L {:.3} differs from report", score.fmeasure);
        }
        if record_text == duplicate_text {
            println!("EXACT MATCH - definite duplicate");
        } else if score.fmeasure > 0.9 {
            println!("VERY HIGH SIMILARITY - near-verbatim duplicate");
        } else if score.fmeasure > 0.7 {
            println!("HIGH SIMILARITY - likely duplicate");
        } else {
            println!("MODERATE SIMILARITY - manual judgement needed");
        }
    }

    Ok(())
}

fn record_text_or_placeholder(split: &data::DatasetSplit, idx: usize) -> &str {
    if idx < split.len() {
        split.key_text(idx)
    } else {
        "<record index out of bounds>"
    }
}

fn maybe_truncate(text: &str, full: bool) -> String {
    if full {
        return text.to_string();
    }
    truncate_text(text, 25)
}

fn truncate_text(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();

    if lines.len() <= max_lines {
        text.to_string()
    } else {
        let truncated_lines = &lines[..max_lines];
        let mut result = truncated_lines.join("\n");
        result.push_str(&format!(
            "\n... [truncated: showing {} of {} lines, use --full to see all]",
            max_lines,
            lines.len()
        ));
        result
    }
}
