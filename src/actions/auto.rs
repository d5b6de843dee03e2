//! Free-text scanning: every store looks for its own identifiers.

use std::ops::Range;
use tracing::debug;

use super::replacement;
use crate::error::Result;
use crate::store::{Kind, StoreRegistry};

pub fn discover(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    for (kind, value) in stores.find_values(text) {
        // Free text is best effort: a candidate a store rejects is left alone.
        if let Err(e) = stores.add_value(kind, &value) {
            debug!("auto: skipped '{}': {}", value, e);
        }
    }
    Ok(())
}

fn is_boundary(c: Option<char>) -> bool {
    c.map(|c| !c.is_alphanumeric()).unwrap_or(true)
}

/// Every standalone occurrence of each found value, longest values first,
/// keeping only spans that do not overlap an earlier one.
fn spans(text: &str, found: &[(Kind, String)]) -> Vec<(Range<usize>, Kind)> {
    let mut found: Vec<&(Kind, String)> = found.iter().collect();
    found.sort_by_key(|(_, v)| std::cmp::Reverse(v.len()));
    let mut taken: Vec<(Range<usize>, Kind)> = Vec::new();
    for (kind, value) in found {
        for (start, m) in text.match_indices(value.as_str()) {
            let end = start + m.len();
            if !is_boundary(text[..start].chars().next_back()) || !is_boundary(text[end..].chars().next()) {
                continue;
            }
            if taken.iter().any(|(r, _)| r.start < end && start < r.end) {
                continue;
            }
            taken.push((start..end, *kind));
        }
    }
    taken.sort_by_key(|(r, _)| r.start);
    taken
}

/// Substitutes all identifiers in a single pass so a replacement is never
/// scanned again.
pub fn anonymize(text: &str, stores: &StoreRegistry) -> Result<String> {
    let found = stores.find_values(text);
    if found.is_empty() {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (range, kind) in spans(text, &found) {
        out.push_str(&text[last..range.start]);
        out.push_str(&replacement(stores, kind, &text[range.clone()])?);
        last = range.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}
