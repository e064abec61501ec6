use serde::Serialize;
use similar::{ChangeTag, TextDiff};

use crate::digest::{ContentDigest, digest, normalize_line_endings};

/// Line-level summary of what an upload changed inside the owned block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub old_digest: Option<ContentDigest>,
    pub new_digest: ContentDigest,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl ChangeSummary {
    /// `previous` is `None` when the block is new, so every line counts as added.
    pub fn between(previous: Option<&str>, new: &str) -> Self {
        let old_text = normalize_line_endings(previous.unwrap_or(""));
        let new_text = normalize_line_endings(new);
        let diff = TextDiff::from_lines(old_text.as_ref(), new_text.as_ref());

        let mut lines_added = 0;
        let mut lines_removed = 0;
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => lines_added += 1,
                ChangeTag::Delete => lines_removed += 1,
                ChangeTag::Equal => {}
            }
        }

        Self {
            old_digest: previous.map(digest),
            new_digest: digest(new),
            lines_added,
            lines_removed,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.old_digest == Some(self.new_digest)
    }
}
