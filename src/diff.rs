//! Unified diff computation, parsing, and application
//!
//! Line-level diffs with a bounded resync lookahead, serialized in the
//! standard unified envelope. Patches apply without touching disk; the
//! applicator decides what gets written.

use serde::{Deserialize, Serialize};

/// Resync search window when lines diverge.
const LOOKAHEAD_WINDOW: usize = 10;
/// Context lines emitted around each change region.
pub const DEFAULT_CONTEXT: usize = 3;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// Added and removed line totals for a hunk or a whole patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
}

impl ChangeCounts {
    pub fn total(&self) -> usize {
        self.added + self.removed
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Count adds and removes in a single pass.
    pub fn change_counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for line in &self.lines {
            match line {
                DiffLine::Add(_) => counts.added += 1,
                DiffLine::Remove(_) => counts.removed += 1,
                DiffLine::Context(_) => {}
            }
        }
        counts
    }
}

/// A patch against one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub is_new: bool,
    pub is_deleted: bool,
    pub hunks: Vec<DiffHunk>,
}

impl FilePatch {
    /// Added and removed lines across every hunk.
    pub fn change_counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for hunk in &self.hunks {
            let hunk_counts = hunk.change_counts();
            counts.added += hunk_counts.added;
            counts.removed += hunk_counts.removed;
        }
        counts
    }

    /// Lines touched, for impact estimates
    pub fn lines_changed(&self) -> usize {
        self.change_counts().total()
    }

    /// Patch that creates `path` with `content`. A single hunk holds every
    /// line as an addition.
    pub fn create(path: impl Into<String>, content: &str) -> Self {
        let lines: Vec<DiffLine> = content.lines().map(|l| DiffLine::Add(l.to_string())).collect();
        let new_count = lines.len();
        FilePatch {
            path: path.into(),
            is_new: true,
            is_deleted: false,
            hunks: vec![DiffHunk {
                old_start: 0,
                old_count: 0,
                new_start: 1,
                new_count,
                lines,
            }],
        }
    }

    /// Patch that deletes `path`, recording its current `content`.
    pub fn delete(path: impl Into<String>, content: &str) -> Self {
        let lines: Vec<DiffLine> =
            content.lines().map(|l| DiffLine::Remove(l.to_string())).collect();
        let old_count = lines.len();
        FilePatch {
            path: path.into(),
            is_new: false,
            is_deleted: true,
            hunks: vec![DiffHunk {
                old_start: 1,
                old_count,
                new_start: 0,
                new_count: 0,
                lines,
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Diff computation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum EditOp {
    Equal(String),
    Remove(String),
    Add(String),
}

/// Compute the edit script between two line sequences.
///
/// Greedy walk with a bounded lookahead: when lines diverge, search up to
/// `LOOKAHEAD_WINDOW` lines ahead on each side for a resync point and take
/// the cheaper one. Good enough for configuration and source edits; not a
/// minimal diff in pathological cases.
fn edit_script(old: &[&str], new: &[&str]) -> Vec<EditOp> {
    let mut ops = Vec::new();
    let mut i = 0;
    let mut j = 0;

    while i < old.len() && j < new.len() {
        if old[i] == new[j] {
            ops.push(EditOp::Equal(old[i].to_string()));
            i += 1;
            j += 1;
            continue;
        }

        let remove_resync = (1..=LOOKAHEAD_WINDOW).find(|k| i + k < old.len() && old[i + k] == new[j]);
        let add_resync = (1..=LOOKAHEAD_WINDOW).find(|k| j + k < new.len() && new[j + k] == old[i]);

        match (remove_resync, add_resync) {
            (Some(rk), Some(ak)) if rk <= ak => {
                for _ in 0..rk {
                    ops.push(EditOp::Remove(old[i].to_string()));
                    i += 1;
                }
            }
            (Some(_), Some(ak)) => {
                for _ in 0..ak {
                    ops.push(EditOp::Add(new[j].to_string()));
                    j += 1;
                }
            }
            (Some(rk), None) => {
                for _ in 0..rk {
                    ops.push(EditOp::Remove(old[i].to_string()));
                    i += 1;
                }
            }
            (None, Some(ak)) => {
                for _ in 0..ak {
                    ops.push(EditOp::Add(new[j].to_string()));
                    j += 1;
                }
            }
            (None, None) => {
                ops.push(EditOp::Remove(old[i].to_string()));
                ops.push(EditOp::Add(new[j].to_string()));
                i += 1;
                j += 1;
            }
        }
    }
    while i < old.len() {
        ops.push(EditOp::Remove(old[i].to_string()));
        i += 1;
    }
    while j < new.len() {
        ops.push(EditOp::Add(new[j].to_string()));
        j += 1;
    }

    ops
}

/// Compute a patch turning `old` into `new`.
///
/// Returns `None` when the contents are identical. Create and delete cases
/// short-circuit to a single hunk via `FilePatch::create` / `delete`.
pub fn compute_patch(path: &str, old: &str, new: &str, context: usize) -> Option<FilePatch> {
    if old == new {
        return None;
    }
    if old.is_empty() {
        return Some(FilePatch::create(path, new));
    }
    if new.is_empty() {
        return Some(FilePatch::delete(path, old));
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);

    let hunks = build_hunks(&ops, context);
    if hunks.is_empty() {
        return None;
    }

    Some(FilePatch {
        path: path.to_string(),
        is_new: false,
        is_deleted: false,
        hunks,
    })
}

/// Group an edit script into hunks with `context` lines around each change
/// region. Regions closer than `2 * context` equals are merged.
fn build_hunks(ops: &[EditOp], context: usize) -> Vec<DiffHunk> {
    // Indices of ops that are changes.
    let change_idx: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, EditOp::Equal(_)))
        .map(|(i, _)| i)
        .collect();
    if change_idx.is_empty() {
        return Vec::new();
    }

    // Merge change indices into regions [start, end] over op indices.
    let mut regions: Vec<(usize, usize)> = Vec::new();
    for &idx in &change_idx {
        match regions.last_mut() {
            Some((_, end)) if idx <= *end + 2 * context + 1 => *end = idx,
            _ => regions.push((idx, idx)),
        }
    }

    // Track old/new line cursors while slicing out each hunk.
    let mut hunks = Vec::new();
    let mut old_line = 1usize;
    let mut new_line = 1usize;
    let mut op_idx = 0usize;

    for (start, end) in regions {
        let hunk_start = start.saturating_sub(context);
        let hunk_end = (end + context).min(ops.len() - 1);

        // Advance cursors to the hunk start.
        while op_idx < hunk_start {
            match &ops[op_idx] {
                EditOp::Equal(_) => {
                    old_line += 1;
                    new_line += 1;
                }
                EditOp::Remove(_) => old_line += 1,
                EditOp::Add(_) => new_line += 1,
            }
            op_idx += 1;
        }

        let old_start = old_line;
        let new_start = new_line;
        let mut lines = Vec::new();
        let mut old_count = 0usize;
        let mut new_count = 0usize;

        while op_idx <= hunk_end {
            match &ops[op_idx] {
                EditOp::Equal(s) => {
                    lines.push(DiffLine::Context(s.clone()));
                    old_line += 1;
                    new_line += 1;
                    old_count += 1;
                    new_count += 1;
                }
                EditOp::Remove(s) => {
                    lines.push(DiffLine::Remove(s.clone()));
                    old_line += 1;
                    old_count += 1;
                }
                EditOp::Add(s) => {
                    lines.push(DiffLine::Add(s.clone()));
                    new_line += 1;
                    new_count += 1;
                }
            }
            op_idx += 1;
        }

        hunks.push(DiffHunk {
            old_start,
            old_count,
            new_start,
            new_count,
            lines,
        });
    }

    hunks
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply a patch to the original content.
///
/// Hunks are applied in descending `new_start` order so earlier offsets
/// remain valid. The result preserves the original's trailing newline.
pub fn apply_patch(original: &str, patch: &FilePatch) -> Result<String, String> {
    if patch.is_new {
        let content: Vec<&str> = patch
            .hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter_map(|l| match l {
                DiffLine::Add(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        return Ok(content.join("\n"));
    }
    if patch.is_deleted {
        return Ok(String::new());
    }

    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();

    let mut ordered: Vec<&DiffHunk> = patch.hunks.iter().collect();
    ordered.sort_by(|a, b| b.new_start.cmp(&a.new_start));

    for hunk in ordered {
        lines = apply_hunk(lines, hunk)?;
    }

    let mut out = lines.join("\n");
    if original.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Replace one hunk's old span with its new section.
fn apply_hunk(mut lines: Vec<String>, hunk: &DiffHunk) -> Result<Vec<String>, String> {
    let start = hunk.old_start.saturating_sub(1);
    if start > lines.len() {
        return Err(format!(
            "hunk start {} beyond end of file ({} lines)",
            hunk.old_start,
            lines.len()
        ));
    }

    let end = (start + hunk.old_count).min(lines.len());

    // Verify the old span matches before splicing.
    let expected: Vec<&str> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
            DiffLine::Add(_) => None,
        })
        .collect();
    let actual: Vec<&str> = lines[start..end].iter().map(|s| s.as_str()).collect();
    if expected != actual {
        return Err(format!(
            "hunk at line {} does not match the target content",
            hunk.old_start
        ));
    }

    let new_section: Vec<String> = hunk
        .lines
        .iter()
        .filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Add(s) => Some(s.clone()),
            DiffLine::Remove(_) => None,
        })
        .collect();

    lines.splice(start..end, new_section);
    Ok(lines)
}

/// Invert a patch: adds become removes, old and new sides swap.
pub fn reverse_patch(patch: &FilePatch) -> FilePatch {
    FilePatch {
        path: patch.path.clone(),
        is_new: patch.is_deleted,
        is_deleted: patch.is_new,
        hunks: patch
            .hunks
            .iter()
            .map(|h| DiffHunk {
                old_start: h.new_start,
                old_count: h.new_count,
                new_start: h.old_start,
                new_count: h.old_count,
                lines: h
                    .lines
                    .iter()
                    .map(|l| match l {
                        DiffLine::Context(s) => DiffLine::Context(s.clone()),
                        DiffLine::Add(s) => DiffLine::Remove(s.clone()),
                        DiffLine::Remove(s) => DiffLine::Add(s.clone()),
                    })
                    .collect(),
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Unified-diff serialisation
// ---------------------------------------------------------------------------

/// Render a patch in the standard unified envelope, `/dev/null` on the
/// absent side for create and delete.
pub fn render_unified(patch: &FilePatch) -> String {
    let mut out = String::new();
    if patch.is_new {
        out.push_str("--- /dev/null\n");
    } else {
        out.push_str(&format!("--- a/{}\n", patch.path));
    }
    if patch.is_deleted {
        out.push_str("+++ /dev/null\n");
    } else {
        out.push_str(&format!("+++ b/{}\n", patch.path));
    }

    for hunk in &patch.hunks {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
        ));
        for line in &hunk.lines {
            match line {
                DiffLine::Context(s) => out.push_str(&format!(" {}\n", s)),
                DiffLine::Add(s) => out.push_str(&format!("+{}\n", s)),
                DiffLine::Remove(s) => out.push_str(&format!("-{}\n", s)),
            }
        }
    }
    out
}

/// Parse a unified diff, possibly covering several files.
pub fn parse_unified(diff: &str) -> Result<Vec<FilePatch>, String> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut patches = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !lines[i].starts_with("--- ") {
            i += 1;
            continue;
        }

        let old_path = parse_path_line(lines[i], "--- ");
        i += 1;
        if i >= lines.len() || !lines[i].starts_with("+++ ") {
            return Err("expected +++ line after ---".to_string());
        }
        let new_path = parse_path_line(lines[i], "+++ ");
        i += 1;

        let is_new = old_path.is_none();
        let is_deleted = new_path.is_none();
        let path = new_path
            .or(old_path)
            .ok_or_else(|| "both sides of the diff are /dev/null".to_string())?;

        let mut hunks = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@ ") {
            let (old_span, new_span) = parse_hunk_header(lines[i])?;
            let (body, consumed) = collect_hunk_body(&lines[i + 1..]);
            hunks.push(DiffHunk {
                old_start: old_span.start,
                old_count: old_span.count,
                new_start: new_span.start,
                new_count: new_span.count,
                lines: body,
            });
            i += 1 + consumed;
        }
        if hunks.is_empty() {
            return Err(format!("no hunks found for {}", path));
        }

        patches.push(FilePatch {
            path,
            is_new,
            is_deleted,
            hunks,
        });
    }

    if patches.is_empty() {
        return Err("no file patches found in diff".to_string());
    }
    Ok(patches)
}

/// Strip the `a/` or `b/` prefix and a trailing timestamp; `/dev/null`
/// becomes `None`.
fn parse_path_line(line: &str, prefix: &str) -> Option<String> {
    let raw = line[prefix.len()..].trim();
    if raw == "/dev/null" {
        return None;
    }
    let mut path = raw
        .trim_start_matches("a/")
        .trim_start_matches("b/")
        .to_string();
    if let Some(tab_pos) = path.find('\t') {
        path = path[..tab_pos].to_string();
    }
    Some(path)
}

/// One side of a hunk header: starting line and line count.
#[derive(Debug, Clone, Copy)]
struct HunkSpan {
    start: usize,
    count: usize,
}

/// Decode `@@ -o,oc +n,nc @@` into the old and new spans.
///
/// The count is optional on either side and defaults to 1, matching the
/// abbreviated form some tools emit for single-line hunks.
fn parse_hunk_header(header: &str) -> Result<(HunkSpan, HunkSpan), String> {
    let bad = || format!("malformed hunk header `{}`", header);

    let inner = header
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(bad)?;
    let (old_part, new_part) = inner.split_once(" +").ok_or_else(bad)?;
    Ok((parse_span(old_part, header)?, parse_span(new_part, header)?))
}

fn parse_span(text: &str, header: &str) -> Result<HunkSpan, String> {
    let number = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| format!("bad number `{}` in hunk header `{}`", s, header))
    };
    match text.split_once(',') {
        Some((start, count)) => Ok(HunkSpan {
            start: number(start)?,
            count: number(count)?,
        }),
        None => Ok(HunkSpan {
            start: number(text)?,
            count: 1,
        }),
    }
}

/// Consume hunk body lines from `lines` until the next structural marker.
///
/// Returns the decoded body plus how many input lines were consumed.
/// Unrecognised lines (the `\ No newline at end of file` marker, mode
/// lines) are consumed but produce no body entry. A bare `+++` inside a
/// body cannot occur in well-formed input because the preceding `---`
/// already terminates the hunk.
fn collect_hunk_body(lines: &[&str]) -> (Vec<DiffLine>, usize) {
    let mut body = Vec::new();
    let mut consumed = 0;

    for raw in lines {
        if raw.starts_with("@@ ") || raw.starts_with("diff ") || raw.starts_with("--- ") {
            break;
        }
        consumed += 1;

        let decoded = match raw.as_bytes().first() {
            Some(b'+') => Some(DiffLine::Add(raw[1..].to_string())),
            Some(b'-') => Some(DiffLine::Remove(raw[1..].to_string())),
            Some(b' ') => Some(DiffLine::Context(raw[1..].to_string())),
            None => Some(DiffLine::Context(String::new())),
            Some(_) => None,
        };
        if let Some(line) = decoded {
            body.push(line);
        }
    }

    (body, consumed)
}
