//! Head/tail pruning for oversized logs
//!
//! Keeps the first and last blocks of a long log and records exactly how
//! many lines were dropped between them.

use serde::{Deserialize, Serialize};

/// A log reduced to a head block, one omission marker, and a tail block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunedLog {
    pub text: String,
    pub total_lines: usize,
    pub kept_head: usize,
    pub kept_tail: usize,
    pub omitted: usize,
}

impl PrunedLog {
    /// Compact stats for the analysis record.
    pub fn stats(&self) -> PruneStats {
        PruneStats {
            total_lines: self.total_lines,
            kept_head: self.kept_head,
            kept_tail: self.kept_tail,
            omitted: self.omitted,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneStats {
    pub total_lines: usize,
    pub kept_head: usize,
    pub kept_tail: usize,
    pub omitted: usize,
}

/// Trim `text` to at most `head + tail` lines.
///
/// Logs that already fit are returned unchanged. Otherwise the output is the
/// first `head` lines, a single marker recording the omitted count, and the
/// last `tail` lines. `kept_head + kept_tail + omitted` always equals
/// `total_lines`.
pub fn prune(text: &str, head: usize, tail: usize) -> PrunedLog {
    let lines: Vec<&str> = text.lines().collect();
    let total_lines = lines.len();

    if total_lines <= head + tail {
        return PrunedLog {
            text: text.to_string(),
            total_lines,
            kept_head: total_lines,
            kept_tail: 0,
            omitted: 0,
        };
    }

    let omitted = total_lines - head - tail;
    let mut out = Vec::with_capacity(head + tail + 1);
    out.extend_from_slice(&lines[..head]);
    let marker = omission_marker(omitted);
    out.push(&marker);
    out.extend_from_slice(&lines[total_lines - tail..]);

    PrunedLog {
        text: out.join("\n"),
        total_lines,
        kept_head: head,
        kept_tail: tail,
        omitted,
    }
}

fn omission_marker(omitted: usize) -> String {
    format!("··· [{} lines omitted] ···", omitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn test_small_log_unchanged() {
        let text = numbered(10);
        let pruned = prune(&text, 100, 500);
        assert_eq!(pruned.text, text);
        assert_eq!(pruned.omitted, 0);
        assert_eq!(pruned.total_lines, 10);
    }

    #[test]
    fn test_exactly_at_limit_unchanged() {
        let text = numbered(8);
        let pruned = prune(&text, 3, 5);
        assert_eq!(pruned.text, text);
        assert_eq!(pruned.omitted, 0);
    }

    #[test]
    fn test_oversized_log_pruned() {
        let text = numbered(1000);
        let pruned = prune(&text, 100, 500);
        assert_eq!(pruned.kept_head, 100);
        assert_eq!(pruned.kept_tail, 500);
        assert_eq!(pruned.omitted, 400);
        assert!(pruned.text.contains("[400 lines omitted]"));
        assert!(pruned.text.starts_with("line 1\n"));
        assert!(pruned.text.ends_with("line 1000"));
    }

    #[test]
    fn test_line_accounting_invariant() {
        for total in [601, 700, 5000] {
            let text = numbered(total);
            let pruned = prune(&text, 100, 500);
            assert_eq!(
                pruned.kept_head + pruned.kept_tail + pruned.omitted,
                pruned.total_lines
            );
        }
    }

    #[test]
    fn test_single_marker_line() {
        let text = numbered(700);
        let pruned = prune(&text, 100, 500);
        let markers = pruned
            .text
            .lines()
            .filter(|l| l.contains("lines omitted"))
            .count();
        assert_eq!(markers, 1);
        // Only the marker is synthesised; every other line comes from input.
        assert_eq!(pruned.text.lines().count(), 601);
    }
}
