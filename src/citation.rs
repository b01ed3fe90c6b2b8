//! Fragment citation addressing.
//!
//! Every fragment is addressable as `D{document_id}-C{fragment_index}`.
//! Downstream question answering prints these markers inline (`[D2-C7]` or
//! `[ID: D2-C7]`); this module renders context blocks carrying the markers
//! and extracts them back out of generated text so each can be resolved to
//! a stored fragment with [`crate::store::resolve_citation`].

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::models::Fragment;

/// Maximum number of fragments rendered into one context block.
pub const MAX_CONTEXT_FRAGMENTS: usize = 10;

/// Per-fragment character limit inside a context block.
pub const CONTEXT_FRAGMENT_CHARS: usize = 1000;

/// Address of a single fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FragmentRef {
    pub document_id: i64,
    pub fragment_index: i64,
}

impl fmt::Display for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}-C{}", self.document_id, self.fragment_index)
    }
}

impl FromStr for FragmentRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix('D')
            .ok_or_else(|| anyhow!("Invalid citation '{}': expected D<doc>-C<index>", s))?;
        let (doc, idx) = rest
            .split_once("-C")
            .ok_or_else(|| anyhow!("Invalid citation '{}': expected D<doc>-C<index>", s))?;

        if doc.is_empty() || !doc.bytes().all(|b| b.is_ascii_digit()) {
            bail!("Invalid citation '{}': bad document id", s);
        }
        if idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
            bail!("Invalid citation '{}': bad fragment index", s);
        }

        Ok(FragmentRef {
            document_id: doc.parse()?,
            fragment_index: idx.parse()?,
        })
    }
}

/// Find every citation marker in `text`, in order of first appearance.
///
/// Recognizes `[D2-C7]` and `[ID: D2-C7]`, doubled brackets (`[[D2-C7]]`)
/// and comma-separated lists (`[D2-C7, ID: D3-C0]`). Bracketed text that
/// does not parse as a fragment address is ignored.
pub fn extract_citations(text: &str) -> Vec<FragmentRef> {
    let mut found = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };

        for part in after[..close].split(',') {
            let part = part.trim().trim_start_matches('[').trim_start();
            let part = part.strip_prefix("ID:").map(str::trim_start).unwrap_or(part);

            if let Ok(r) = part.parse::<FragmentRef>() {
                if !found.contains(&r) {
                    found.push(r);
                }
            }
        }
        rest = &after[close + 1..];
    }

    found
}

/// Render fragments as a context block, one `[ID: D{d}-C{i}] text` entry each.
pub fn context_block(fragments: &[Fragment]) -> String {
    fragments
        .iter()
        .take(MAX_CONTEXT_FRAGMENTS)
        .map(|f| {
            let text: String = f.text.chars().take(CONTEXT_FRAGMENT_CHARS).collect();
            format!("[ID: {}] {}", f.reference(), text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
