// ROUGE-L scoring used to confirm LSH candidates as true near-duplicates.

use rust_stemmers::{Algorithm, Stemmer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub precision: f64,
    pub recall: f64,
    pub fmeasure: f64,
}

impl Score {
    fn zero() -> Self {
        Score {
            precision: 0.0,
            recall: 0.0,
            fmeasure: 0.0,
        }
    }
}

/// Longest-common-subsequence ROUGE scorer. Tokenization mirrors the usual
/// reference implementation: lowercase, alphanumeric runs only, and optional
/// English stemming of tokens longer than three characters.
pub struct RougeScorer {
    stemmer: Option<Stemmer>,
}

impl RougeScorer {
    pub fn new(use_stemmer: bool) -> Self {
        let stemmer = use_stemmer.then(|| Stemmer::create(Algorithm::English));
        RougeScorer { stemmer }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut tokens = Vec::new();
        let mut current = String::new();
        for c in lowered.chars() {
            if c.is_ascii_alphanumeric() {
                current.push(c);
            } else if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }

        if let Some(stemmer) = &self.stemmer {
            tokens = tokens
                .into_iter()
                .map(|token| {
                    // Short tokens are left alone, matching rouge-score.
                    if token.len() > 3 {
                        stemmer.stem(&token).into_owned()
                    } else {
                        token
                    }
                })
                .collect();
        }
        tokens
    }

    /// ROUGE-L between a target and a prediction: LCS-based precision over
    /// the prediction, recall over the target, harmonic-mean F.
    pub fn rouge_l(&self, target: &str, prediction: &str) -> Score {
        let target_tokens = self.tokenize(target);
        let prediction_tokens = self.tokenize(prediction);
        if target_tokens.is_empty() || prediction_tokens.is_empty() {
            return Score::zero();
        }

        let lcs = lcs_len(&target_tokens, &prediction_tokens) as f64;
        let precision = lcs / prediction_tokens.len() as f64;
        let recall = lcs / target_tokens.len() as f64;
        let fmeasure = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Score {
            precision,
            recall,
            fmeasure,
        }
    }
}

// Two-row DP; O(min) memory matters when assistant replies run long.
fn lcs_len(a: &[String], b: &[String]) -> usize {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut prev = vec![0usize; short.len() + 1];
    let mut curr = vec![0usize; short.len() + 1];

    for long_token in long {
        for (j, short_token) in short.iter().enumerate() {
            curr[j + 1] = if long_token == short_token {
                prev[j] + 1
            } else {
                std::cmp::max(prev[j + 1], curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}
