// src/memopedia/diff.rs
// Unified text diffs for page edit history
//
// Diffs are computed over the page composite string
// ("title: T\nsummary: S\ncontent:\nC"). History stores diffs rather than
// snapshots; reconstructing an old version replays diffs in reverse from the
// current state, so the hunk format here must reverse-apply exactly.

use anyhow::{Context, Result, bail};
use similar::{DiffOp, TextDiff};

/// Context lines around each change.
const CONTEXT_RADIUS: usize = 3;

/// Unified diff from `old` to `new`, empty string when the texts are equal.
///
/// Hunk headers use standard `@@ -a,b +c,d @@` line ranges (1-based starts;
/// a zero length positions the hunk after line a).
pub fn generate_diff(old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }

    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let diff = TextDiff::from_slices(&old_lines, &new_lines);

    let mut out = String::new();
    for group in diff.grouped_ops(CONTEXT_RADIUS) {
        let Some(first) = group.first() else {
            continue;
        };
        let old_start = first.old_range().start;
        let old_len: usize = group.iter().map(|op| op.old_range().len()).sum();
        let new_start = first.new_range().start;
        let new_len: usize = group.iter().map(|op| op.new_range().len()).sum();

        // 1-based display positions; empty ranges keep the 0-length convention.
        let old_pos = if old_len == 0 { old_start } else { old_start + 1 };
        let new_pos = if new_len == 0 { new_start } else { new_start + 1 };
        out.push_str(&format!("@@ -{old_pos},{old_len} +{new_pos},{new_len} @@\n"));

        for op in &group {
            match op {
                DiffOp::Equal { old_index, len, .. } => {
                    for line in &old_lines[*old_index..old_index + len] {
                        out.push(' ');
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                DiffOp::Delete { old_index, old_len, .. } => {
                    for line in &old_lines[*old_index..old_index + old_len] {
                        out.push('-');
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                DiffOp::Insert { new_index, new_len, .. } => {
                    for line in &new_lines[*new_index..new_index + new_len] {
                        out.push('+');
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                DiffOp::Replace { old_index, old_len, new_index, new_len, .. } => {
                    for line in &old_lines[*old_index..old_index + old_len] {
                        out.push('-');
                        out.push_str(line);
                        out.push('\n');
                    }
                    for line in &new_lines[*new_index..new_index + new_len] {
                        out.push('+');
                        out.push_str(line);
                        out.push('\n');
                    }
                }
            }
        }
    }
    out
}

struct Hunk {
    old_start: usize, // 0-based
    new_start: usize, // 0-based
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut lines = diff.split('\n').peekable();

    while let Some(line) = lines.next() {
        if line.is_empty() && lines.peek().is_none() {
            break;
        }
        let header = line
            .strip_prefix("@@ -")
            .with_context(|| format!("expected hunk header, got: {line:?}"))?;
        let (old_part, rest) = header.split_once(" +").context("malformed hunk header")?;
        let new_part = rest.strip_suffix(" @@").context("malformed hunk header")?;

        let parse_range = |part: &str| -> Result<(usize, usize)> {
            let (pos, len) = part.split_once(',').context("malformed range")?;
            Ok((pos.parse()?, len.parse()?))
        };
        let (old_pos, old_len) = parse_range(old_part)?;
        let (new_pos, new_len) = parse_range(new_part)?;
        let old_start = if old_len == 0 { old_pos } else { old_pos - 1 };
        let new_start = if new_len == 0 { new_pos } else { new_pos - 1 };

        let mut hunk = Hunk {
            old_start,
            new_start,
            old_lines: Vec::new(),
            new_lines: Vec::new(),
        };
        while hunk.old_lines.len() < old_len || hunk.new_lines.len() < new_len {
            let body = lines.next().context("hunk body ended early")?;
            match body.chars().next() {
                Some(' ') | None => {
                    let text = body.get(1..).unwrap_or("").to_string();
                    hunk.old_lines.push(text.clone());
                    hunk.new_lines.push(text);
                }
                Some('-') => hunk.old_lines.push(body[1..].to_string()),
                Some('+') => hunk.new_lines.push(body[1..].to_string()),
                Some(other) => bail!("unexpected hunk line prefix {other:?}"),
            }
        }
        hunks.push(hunk);
    }
    Ok(hunks)
}

/// Apply a diff backwards: given the post-edit text, reconstruct the
/// pre-edit text.
///
/// Hunks are spliced bottom-to-top at their new-side positions so earlier
/// splices never shift later ones. The new-side lines are verified against
/// the input before splicing; a mismatch means the diff does not belong to
/// this text.
pub fn apply_diff_reverse(current: &str, diff: &str) -> Result<String> {
    if diff.is_empty() {
        return Ok(current.to_string());
    }

    let mut lines: Vec<String> = current.split('\n').map(str::to_string).collect();
    let mut hunks = parse_hunks(diff)?;
    hunks.sort_by_key(|h| h.new_start);

    for hunk in hunks.iter().rev() {
        let end = hunk.new_start + hunk.new_lines.len();
        if end > lines.len() {
            bail!(
                "hunk range {}..{end} out of bounds ({} lines)",
                hunk.new_start,
                lines.len()
            );
        }
        let actual = &lines[hunk.new_start..end];
        if actual != hunk.new_lines.as_slice() {
            bail!("hunk does not match text at line {}", hunk.new_start + 1);
        }
        lines.splice(hunk.new_start..end, hunk.old_lines.iter().cloned());
    }

    Ok(lines.join("\n"))
}
