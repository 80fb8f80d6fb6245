//! Split outbound text into units that fit one radio packet.
//!
//! Cuts land on whitespace where possible, and whitespace around a cut is
//! dropped, so no chunk starts or ends with it and none is blank. A single
//! word longer than the limit is split at the last UTF-8 character boundary
//! that fits. Sizes are counted in bytes.

/// Smallest usable limit: one character of any width.
const MIN_CHUNK: usize = 4;

/// Split `text` into chunks of at most `max_bytes` bytes each.
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(MIN_CHUNK);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            push_piece(&mut chunks, rest);
            break;
        }

        let cut = rest
            .char_indices()
            .take_while(|(i, _)| *i <= max_bytes)
            .filter(|(_, c)| c.is_whitespace())
            .last();

        let (piece, tail) = match cut {
            Some((at, c)) => (&rest[..at], &rest[at + c.len_utf8()..]),
            None => rest.split_at(hard_split(rest, max_bytes)),
        };
        push_piece(&mut chunks, piece);
        rest = tail.trim_start();
    }
    chunks
}

fn push_piece(chunks: &mut Vec<String>, piece: &str) {
    let piece = piece.trim_end();
    if !piece.is_empty() {
        chunks.push(piece.to_string());
    }
}

/// Like [`chunk_text`], but when more than one chunk results each carries a
/// ` [i/n]` suffix and the room for it is reserved inside `max_bytes`.
pub fn chunk_with_markers(text: &str, max_bytes: usize) -> Vec<String> {
    let plain = chunk_text(text, max_bytes);
    if plain.len() <= 1 {
        return plain;
    }

    // The marker width depends on the count, which depends on the width.
    let mut reserve = marker_len(plain.len());
    loop {
        let chunks = chunk_text(text, max_bytes.saturating_sub(reserve));
        let needed = marker_len(chunks.len());
        if needed <= reserve {
            let total = chunks.len();
            return chunks
                .into_iter()
                .enumerate()
                .map(|(i, c)| format!("{} [{}/{}]", c, i + 1, total))
                .collect();
        }
        reserve = needed;
    }
}

fn marker_len(total: usize) -> usize {
    // " [" + i + "/" + n + "]" with i no wider than n
    2 * digits(total) + 4
}

fn digits(mut n: usize) -> usize {
    let mut d = 1;
    while n >= 10 {
        n /= 10;
        d += 1;
    }
    d
}

/// Largest char boundary at or below `max_bytes`, but never zero.
fn hard_split(s: &str, max_bytes: usize) -> usize {
    let mut at = max_bytes.min(s.len());
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    if at == 0 {
        at = s.chars().next().map(char::len_utf8).unwrap_or(s.len());
    }
    at
}
