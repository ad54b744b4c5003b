use crate::config::ChunkConfig;

/// How far (in characters) a cut point may drift from its nominal offset
/// while snapping to a paragraph or sentence boundary.
const BOUNDARY_WINDOW: usize = 200;

/// A sub-window of a document body, indexed as an independent retrieval
/// unit. Offsets are character positions into the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split a body into overlapping windows per the adaptive policy: bodies at
/// or under the threshold come back as a single chunk; longer bodies are cut
/// into `chunk_size` windows with `chunk_overlap` carried between them, each
/// cut snapped to the nearest paragraph boundary within the window, then the
/// nearest sentence boundary, then the nominal offset.
pub fn chunk_body(body: &str, cfg: &ChunkConfig) -> Vec<Chunk> {
    let chars: Vec<(usize, char)> = body.char_indices().collect();
    let n = chars.len();

    if n == 0 {
        return vec![];
    }
    if n <= cfg.threshold {
        return vec![Chunk {
            ordinal: 0,
            start: 0,
            end: n,
            text: body.to_string(),
        }];
    }

    let byte_at = |char_idx: usize| -> usize {
        if char_idx >= n {
            body.len()
        } else {
            chars[char_idx].0
        }
    };

    // Boundary candidates, as char offsets of the position *after* the
    // boundary (the start of the next paragraph / sentence).
    let mut paragraphs: Vec<usize> = Vec::new();
    let mut sentences: Vec<usize> = Vec::new();
    for i in 0..n.saturating_sub(1) {
        if chars[i].1 == '\n' && chars[i + 1].1 == '\n' {
            paragraphs.push(i + 2);
        }
        if matches!(chars[i].1, '.' | '!' | '?') && chars[i + 1].1.is_whitespace() {
            sentences.push(i + 2);
        }
    }

    let overlap = cfg.chunk_overlap.min(cfg.chunk_size.saturating_sub(1));
    let mut chunks = Vec::new();
    let mut pos = 0usize;

    loop {
        let nominal = pos + cfg.chunk_size;
        if nominal >= n {
            chunks.push(make_chunk(body, chunks.len(), pos, n, byte_at(pos), body.len()));
            break;
        }

        // A snapped cut must leave at least half a window behind it, or the
        // same boundary would be re-chosen forever as the windows advance.
        let min_cut = pos + (cfg.chunk_size / 2).max(1);
        let cut = nearest_in_window(&paragraphs, nominal, min_cut, n)
            .or_else(|| nearest_in_window(&sentences, nominal, min_cut, n))
            .unwrap_or(nominal);

        chunks.push(make_chunk(
            body,
            chunks.len(),
            pos,
            cut,
            byte_at(pos),
            byte_at(cut),
        ));

        if cut >= n {
            break;
        }
        // Carry the overlap into the next window, guaranteeing progress.
        pos = cut.saturating_sub(overlap).max(pos + 1);
    }

    chunks
}

fn make_chunk(
    body: &str,
    ordinal: usize,
    start: usize,
    end: usize,
    byte_start: usize,
    byte_end: usize,
) -> Chunk {
    Chunk {
        ordinal,
        start,
        end,
        text: body[byte_start..byte_end].to_string(),
    }
}

/// The candidate closest to `nominal` within ±BOUNDARY_WINDOW, no earlier
/// than `min_cut` and no later than `max`. Candidates are sorted, so a
/// binary search finds the neighborhood.
fn nearest_in_window(
    candidates: &[usize],
    nominal: usize,
    min_cut: usize,
    max: usize,
) -> Option<usize> {
    let lo = nominal.saturating_sub(BOUNDARY_WINDOW).max(min_cut);
    let hi = (nominal + BOUNDARY_WINDOW).min(max);
    if lo > hi {
        return None;
    }

    let start = candidates.partition_point(|&c| c < lo);
    let end = candidates.partition_point(|&c| c <= hi);
    candidates[start..end]
        .iter()
        .min_by_key(|&&c| c.abs_diff(nominal))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: usize, size: usize, overlap: usize) -> ChunkConfig {
        ChunkConfig {
            threshold,
            chunk_size: size,
            chunk_overlap: overlap,
        }
    }

    #[test]
    fn short_body_is_one_chunk() {
        let body = "a short note body";
        let chunks = chunk_body(body, &cfg(4000, 1000, 200));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, body);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!((chunks[0].start, chunks[0].end), (0, body.chars().count()));
    }

    #[test]
    fn empty_body_yields_nothing() {
        assert!(chunk_body("", &cfg(4000, 1000, 200)).is_empty());
    }

    #[test]
    fn long_body_produces_overlapping_windows() {
        let body = "word ".repeat(300); // 1500 chars
        let chunks = chunk_body(&body, &cfg(400, 200, 50));
        assert!(chunks.len() > 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
            assert!(c.end > c.start);
        }
        // Consecutive chunks overlap and between them cover the whole body.
        for pair in chunks.windows(2) {
            assert!(pair[1].start < pair[0].end);
        }
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, body.chars().count());
    }

    #[test]
    fn cut_snaps_to_paragraph_boundary() {
        // One blank line 30 chars before the nominal 200-char cut.
        let first = "x".repeat(170);
        let second = "y".repeat(400);
        let body = format!("{}\n\n{}", first, second);
        let chunks = chunk_body(&body, &cfg(100, 200, 20));
        // First chunk ends at the paragraph start (offset 172).
        assert_eq!(chunks[0].end, 172);
        assert!(chunks[0].text.starts_with('x'));
        assert!(chunks[1].text.contains('y'));
    }

    #[test]
    fn cut_falls_back_to_sentence_boundary() {
        let first = "s".repeat(150);
        let body = format!("{}. {}", first, "t".repeat(400));
        let chunks = chunk_body(&body, &cfg(100, 200, 20));
        // No blank lines anywhere; the sentence end at offset 152 wins.
        assert_eq!(chunks[0].end, 152);
    }

    #[test]
    fn no_boundary_cuts_at_nominal_offset() {
        let body = "z".repeat(900);
        let chunks = chunk_body(&body, &cfg(100, 300, 50));
        assert_eq!(chunks[0].end, 300);
        assert_eq!(chunks[1].start, 250);
    }

    #[test]
    fn multibyte_bodies_slice_on_char_boundaries() {
        let body = "ありがとう。 ".repeat(120); // well over threshold, multibyte
        let chunks = chunk_body(&body, &cfg(200, 100, 20));
        assert!(chunks.len() > 1);
        let total: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(total.len() >= body.len()); // overlap duplicates, never truncates
    }
}
