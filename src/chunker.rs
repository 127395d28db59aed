// src/chunker.rs
// Natural-boundary text chunking for embedding generation
//
// Boundaries are sentence endings (the Japanese full stop "。") and newlines.
// Oversize provisional chunks are halved repeatedly; undersized chunks are
// merged forward into their successor, falling back to the predecessor.

/// Split `text` into natural chunks bounded by min/max character thresholds.
///
/// The concatenation of the returned chunks always equals the input.
/// Edge cases: empty input returns `[""]`; `max_chars == 0` disables
/// splitting and returns the input whole; `min_chars > max_chars` is clamped
/// down to `max_chars`.
pub fn chunk_text(text: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.is_empty() {
        return vec![text.to_string()];
    }
    let min_chars = min_chars.min(max_chars);

    // Step 1: provisional segmentation at natural boundaries.
    let mut provisional: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == '。' || ch == '\n' {
            provisional.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        provisional.push(current);
    }
    if provisional.is_empty() {
        provisional.push(text.to_string());
    }

    // Step 2: halve any segment still over max_chars.
    let mut normalized: Vec<String> = Vec::new();
    for seg in provisional {
        split_to_max(seg, max_chars, &mut normalized);
    }

    if min_chars == 0 || normalized.len() <= 1 {
        return normalized;
    }

    // Step 3: merge undersized chunks until a fixpoint.
    let mut chunks = normalized;
    loop {
        let (merged, changed) = merge_small(chunks, min_chars);
        chunks = merged;
        if !changed || chunks.len() <= 1 {
            break;
        }
        if chunks.iter().all(|c| c.chars().count() >= min_chars) {
            break;
        }
    }

    chunks
}

/// Repeatedly split at the character midpoint until every piece fits.
fn split_to_max(segment: String, max_chars: usize, out: &mut Vec<String>) {
    let mut pending = vec![segment];
    while let Some(part) = pending.pop() {
        let char_count = part.chars().count();
        if char_count > max_chars {
            let mid = char_count / 2;
            let byte_mid = part
                .char_indices()
                .nth(mid)
                .map(|(i, _)| i)
                .unwrap_or(part.len());
            let (left, right) = part.split_at(byte_mid);
            // Push right first so the left half is processed (and emitted) first.
            pending.push(right.to_string());
            pending.push(left.to_string());
        } else {
            out.push(part);
        }
    }
}

/// One merge pass. An undersized chunk is prepended to its successor when one
/// exists, otherwise appended to the already-emitted predecessor.
fn merge_small(mut segments: Vec<String>, min_chars: usize) -> (Vec<String>, bool) {
    let mut changed = false;
    let mut merged: Vec<String> = Vec::with_capacity(segments.len());
    let total = segments.len();
    let mut i = 0;
    while i < total {
        let segment = std::mem::take(&mut segments[i]);
        if segment.chars().count() >= min_chars || total == 1 {
            merged.push(segment);
            i += 1;
            continue;
        }

        if i + 1 < total {
            let merged_forward = format!("{segment}{}", segments[i + 1]);
            segments[i + 1] = merged_forward;
            changed = true;
        } else if let Some(last) = merged.last_mut() {
            last.push_str(&segment);
            changed = true;
        } else {
            merged.push(segment);
        }
        i += 1;
    }
    (merged, changed)
}
