//! Token budgeting for backend prompts
//!
//! Estimates are heuristic: the average of a word-based and a char-based
//! guess tracks real tokenizers closely enough for budget decisions. A
//! safety fraction keeps prompts well under each model's hard cap.

use super::models::Model;

/// Fraction of the model cap the budgeter is willing to spend.
const SAFETY_FRACTION: f64 = 0.80;
/// Fraction of the cap reserved for the completion.
const OUTPUT_RESERVATION: f64 = 0.20;
/// Line-dropping passes before falling back to hard truncation.
const MAX_TRUNCATE_ITERATIONS: usize = 20;

/// Where `truncate_to_fit` removes content from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateStrategy {
    Start,
    End,
    Middle,
}

/// Estimate the token count of a text.
///
/// Average of 1.3 tokens per word and 0.25 tokens per character.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count() as f64 * 1.3;
    let chars = text.chars().count() as f64 * 0.25;
    ((words + chars) / 2.0).round() as usize
}

/// Result of a pre-flight budget check.
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub input_tokens: usize,
    pub output_reservation: usize,
    pub remaining: usize,
    pub within_budget: bool,
}

/// Per-call token budgeter for one model.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    cap: usize,
}

impl TokenBudget {
    pub fn for_model(model: Model) -> Self {
        Self {
            cap: model.context_window(),
        }
    }

    /// Use an explicit cap, e.g. from `FORGE_TOKEN_BUDGET`.
    pub fn with_cap(cap: usize) -> Self {
        Self { cap }
    }

    /// Tokens the budgeter will actually spend on input.
    pub fn ceiling(&self) -> usize {
        let reserved = (self.cap as f64 * OUTPUT_RESERVATION) as usize;
        ((self.cap as f64 * SAFETY_FRACTION) as usize).saturating_sub(reserved)
    }

    /// Check whether system + user + context fit the budget.
    pub fn check(&self, system: &str, user: &str, context: &str) -> BudgetCheck {
        let input_tokens =
            estimate_tokens(system) + estimate_tokens(user) + estimate_tokens(context);
        let output_reservation = (self.cap as f64 * OUTPUT_RESERVATION) as usize;
        let ceiling = self.ceiling();
        BudgetCheck {
            input_tokens,
            output_reservation,
            remaining: ceiling.saturating_sub(input_tokens),
            within_budget: input_tokens <= ceiling,
        }
    }

    /// Shrink `text` until it fits `max_tokens`.
    ///
    /// Drops lines from the chosen end (or the middle) in up to
    /// `MAX_TRUNCATE_ITERATIONS` passes, then hard-truncates by characters
    /// if the text still does not fit.
    pub fn truncate_to_fit(
        &self,
        text: &str,
        max_tokens: usize,
        strategy: TruncateStrategy,
    ) -> String {
        if estimate_tokens(text) <= max_tokens {
            return text.to_string();
        }

        let mut lines: Vec<&str> = text.lines().collect();
        for _ in 0..MAX_TRUNCATE_ITERATIONS {
            if lines.len() <= 1 {
                break;
            }
            // Drop a fifth of the remaining lines each pass; twenty passes
            // reach well below one percent of the input.
            let drop = (lines.len() / 5).max(1);
            match strategy {
                TruncateStrategy::Start => {
                    lines.drain(..drop.min(lines.len()));
                }
                TruncateStrategy::End => {
                    let keep = lines.len().saturating_sub(drop);
                    lines.truncate(keep);
                }
                TruncateStrategy::Middle => {
                    let mid = lines.len() / 2;
                    let start = mid.saturating_sub(drop / 2);
                    let end = (start + drop).min(lines.len());
                    lines.drain(start..end);
                }
            }
            let candidate = lines.join("\n");
            if estimate_tokens(&candidate) <= max_tokens {
                return candidate;
            }
        }

        // Hard fallback: character truncation. Four characters per token is
        // the conservative inverse of the char heuristic.
        let joined = lines.join("\n");
        let max_chars = max_tokens * 4;
        if joined.chars().count() <= max_chars {
            joined
        } else {
            joined.chars().take(max_chars).collect()
        }
    }

    /// Build a prompt-sized window over a log: head, omission marker, tail.
    /// Falls back to middle truncation when the window is still too large.
    pub fn optimize_log_snippet(&self, text: &str, max_tokens: usize) -> String {
        if estimate_tokens(text) <= max_tokens {
            return text.to_string();
        }

        let lines: Vec<&str> = text.lines().collect();
        let head = lines.len() / 4;
        let tail = lines.len() / 2;
        if head + tail < lines.len() {
            let omitted = lines.len() - head - tail;
            let mut window = Vec::with_capacity(head + tail + 1);
            window.extend_from_slice(&lines[..head]);
            let marker = format!("··· [{} lines omitted] ···", omitted);
            window.push(&marker);
            window.extend_from_slice(&lines[lines.len() - tail..]);
            let snippet = window.join("\n");
            if estimate_tokens(&snippet) <= max_tokens {
                return snippet;
            }
            return self.truncate_to_fit(&snippet, max_tokens, TruncateStrategy::Middle);
        }

        self.truncate_to_fit(text, max_tokens, TruncateStrategy::Middle)
    }
}
