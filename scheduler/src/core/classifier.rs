//! Deterministic classification of codex source into sync vs async.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::core::types::CallMode;

static YIELD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\byield\b").unwrap());
static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:async\s+)?def\s+async_task\s*\(").unwrap()
});

/// Which suspension marker caused an `Async` classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// A `yield` token anywhere in the text.
    Yield,
    /// A top-level `async_task` entry point definition.
    EntryPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub mode: CallMode,
    /// `None` means no marker was found and `Sync` was assumed.
    pub marker: Option<Marker>,
}

/// Classify source text into `Sync` or `Async`.
///
/// - `Async` if the text contains a `yield` token or defines a top-level
///   `async_task` function.
/// - Everything else defaults to `Sync`.
///
/// The search is textual: markers inside comments or string literals count.
pub fn classify(source: &str) -> CallMode {
    classify_detailed(source).mode
}

pub fn classify_detailed(source: &str) -> Classification {
    let marker = if ENTRY_RE.is_match(source) {
        Some(Marker::EntryPoint)
    } else if YIELD_RE.is_match(source) {
        Some(Marker::Yield)
    } else {
        None
    };

    match marker {
        Some(marker) => Classification {
            mode: CallMode::Async,
            marker: Some(marker),
        },
        None => {
            debug!("no suspension marker found, defaulting to sync");
            Classification {
                mode: CallMode::Sync,
                marker: None,
            }
        }
    }
}
