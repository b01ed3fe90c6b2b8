//! Overlapping-window text fragmenter.
//!
//! Splits document text into [`Fragment`]s of at most `max_tokens` with
//! `overlap_tokens` of shared context between neighbors. Splitting prefers
//! paragraph boundaries (`\n\n`), then lines, then words, and only cuts
//! inside a word when a single word exceeds the window. Pieces are merged
//! greedily up to the window size; when a window is flushed, its tail (up
//! to the overlap size) seeds the next one.
//!
//! Output is deterministic for identical text and configuration.

use std::collections::VecDeque;

use tracing::warn;

use crate::config::FragmentingConfig;
use crate::models::Fragment;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

const TARGET_TOKENS: std::ops::RangeInclusive<usize> = 800..=1200;
const TARGET_OVERLAP: std::ops::RangeInclusive<usize> = 100..=200;

#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_chars: usize,
    overlap_chars: usize,
}

impl Fragmenter {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        if !TARGET_TOKENS.contains(&max_tokens) || !TARGET_OVERLAP.contains(&overlap_tokens) {
            warn!(
                max_tokens,
                overlap_tokens, "fragment window outside the 800-1200 / 100-200 token targets"
            );
        }
        let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
        Self {
            max_chars,
            overlap_chars: (overlap_tokens * CHARS_PER_TOKEN).min(max_chars - 1),
        }
    }

    pub fn from_config(config: &FragmentingConfig) -> Self {
        Self::new(config.max_tokens, config.overlap_tokens)
    }

    /// Split text into fragment strings. Blank text yields no fragments.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        self.split_recursive(text, &SEPARATORS)
    }

    /// Fragment a document, numbering fragments contiguously from 0.
    pub fn fragment_document(&self, document_id: i64, text: &str) -> Vec<Fragment> {
        self.split(text)
            .into_iter()
            .enumerate()
            .map(|(i, text)| Fragment {
                document_id,
                fragment_index: i as i64,
                text,
                embedding: None,
            })
            .collect()
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // First separator present in the text; "" always matches
        let pos = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .unwrap_or(separators.len() - 1);
        let separator = separators[pos];
        let remaining = &separators[pos + 1..];

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|p| !p.is_empty()).collect()
        };

        let mut out = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) <= self.max_chars {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                out.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if remaining.is_empty() {
                out.push(piece.trim().to_string());
            } else {
                out.extend(self.split_recursive(piece, remaining));
            }
        }
        if !fitting.is_empty() {
            out.extend(self.merge(&fitting, separator));
        }

        out
    }

    /// Greedily pack pieces into windows, carrying an overlapping tail forward.
    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut windows = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            let joined_len = |current: &VecDeque<&str>, total: usize| {
                total + len + if current.is_empty() { 0 } else { sep_len }
            };

            if joined_len(&current, total) > self.max_chars && !current.is_empty() {
                push_window(&mut windows, &current, separator);

                // Keep a tail no longer than the overlap that still leaves room
                while total > self.overlap_chars
                    || (total > 0 && joined_len(&current, total) > self.max_chars)
                {
                    let Some(front) = current.pop_front() else {
                        break;
                    };
                    total -= char_len(front) + if current.is_empty() { 0 } else { sep_len };
                }
            }

            total = joined_len(&current, total);
            current.push_back(piece);
        }

        push_window(&mut windows, &current, separator);
        windows
    }
}

fn push_window(windows: &mut Vec<String>, current: &VecDeque<&str>, separator: &str) {
    let joined = current.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        windows.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("w{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_text_single_fragment() {
        let fragments = Fragmenter::new(1000, 150).fragment_document(1, "Hello, world!");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].fragment_index, 0);
        assert_eq!(fragments[0].text, "Hello, world!");
        assert_eq!(fragments[0].document_id, 1);
    }

    #[test]
    fn test_blank_text_has_no_fragments() {
        let f = Fragmenter::new(1000, 150);
        assert!(f.fragment_document(1, "").is_empty());
        assert!(f.fragment_document(1, "  \n\n \t").is_empty());
    }

    #[test]
    fn test_fragments_respect_window() {
        // max 10 tokens => 40 chars
        let f = Fragmenter::new(10, 3);
        let text = words(200);
        let fragments = f.split(&text);
        assert!(fragments.len() > 1);
        for frag in &fragments {
            assert!(frag.chars().count() <= 40, "too long: {:?}", frag);
        }
    }

    #[test]
    fn test_neighbors_overlap() {
        let f = Fragmenter::new(10, 3);
        let fragments = f.split(&words(200));
        for pair in fragments.windows(2) {
            let first_word = pair[1].split(' ').next().unwrap();
            assert!(
                pair[0].split(' ').any(|w| w == first_word),
                "no overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_every_word_is_covered() {
        let f = Fragmenter::new(10, 3);
        let text = words(120);
        let fragments = f.split(&text);
        for w in text.split(' ') {
            assert!(
                fragments.iter().any(|frag| frag.split(' ').any(|x| x == w)),
                "word {} missing",
                w
            );
        }
    }

    #[test]
    fn test_paragraph_boundaries_preferred() {
        let f = Fragmenter::new(10, 2);
        let text = "Alpha paragraph one.\n\nBeta paragraph two.\n\nGamma paragraph three.";
        let fragments = f.split(text);
        assert_eq!(
            fragments,
            vec![
                "Alpha paragraph one.",
                "Beta paragraph two.",
                "Gamma paragraph three."
            ]
        );
    }

    #[test]
    fn test_long_word_is_hard_split() {
        let f = Fragmenter::new(10, 2);
        let text = "a".repeat(100);
        let fragments = f.split(&text);
        assert!(fragments.len() >= 3);
        for frag in &fragments {
            assert!(frag.chars().count() <= 40);
        }
    }

    #[test]
    fn test_multibyte_text_is_split_on_char_boundaries() {
        let f = Fragmenter::new(2, 1);
        let text = "é".repeat(30);
        let fragments = f.split(&text);
        assert!(fragments.iter().all(|s| s.chars().count() <= 8));
    }

    #[test]
    fn test_indices_contiguous_and_deterministic() {
        let f = Fragmenter::new(10, 3);
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let a = f.fragment_document(4, &text);
        let b = f.fragment_document(4, &text);
        assert_eq!(a, b);
        for (i, frag) in a.iter().enumerate() {
            assert_eq!(frag.fragment_index, i as i64);
        }
    }
}
