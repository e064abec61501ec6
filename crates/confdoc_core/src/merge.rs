use tracing::debug;

use crate::digest::digest;
use crate::macros::{MacroKind, build, locate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub body: String,
    pub changed: bool,
    /// Payload of the replaced block, when one was owned by the file.
    pub previous_content: Option<String>,
}

/// Merge `new_content` for `file` into an existing page body.
///
/// The first block of `kind` whose title contains `file` (ignoring case)
/// is owned by the file and replaced in place; everything around it is kept
/// byte for byte. Without an owned block a new block is appended. Only the
/// first owned block is touched even if several titles match.
pub fn merge(
    file: &str,
    existing_body: Option<&str>,
    new_content: &str,
    kind: MacroKind,
    now_label: &str,
) -> MergeResult {
    let title = format!("{file} ({now_label})");
    let replacement = build(kind, &title, new_content);
    let needle = file.to_lowercase();

    let owned = locate(existing_body, kind)
        .find(|block| block.title.to_lowercase().contains(&needle));

    match (existing_body, owned) {
        (Some(body), Some(block)) => {
            let changed = digest(new_content) != digest(block.inner_content);
            debug!(
                file,
                kind = kind.as_str(),
                start = block.span.start,
                changed,
                "replacing owned macro block"
            );
            let mut merged =
                String::with_capacity(body.len() - block.span.len() + replacement.len());
            merged.push_str(&body[..block.span.start]);
            merged.push_str(&replacement);
            merged.push_str(&body[block.span.end..]);
            MergeResult {
                body: merged,
                changed,
                previous_content: Some(block.inner_content.to_string()),
            }
        }
        (Some(body), None) => {
            debug!(file, kind = kind.as_str(), "appending macro block to existing body");
            MergeResult {
                body: format!("{body}{replacement}"),
                changed: true,
                previous_content: None,
            }
        }
        (None, _) => {
            debug!(file, kind = kind.as_str(), "starting new body");
            MergeResult {
                body: replacement,
                changed: false,
                previous_content: None,
            }
        }
    }
}
