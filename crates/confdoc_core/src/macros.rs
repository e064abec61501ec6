//! Storage-format macro blocks: locating existing blocks inside a page body and
//! rendering new ones.
//!
//! Block extents come from a balanced scan over `<ac:structured-macro>` open and
//! close tags (CDATA sections are skipped, so payload text never opens or closes
//! a block). Title and payload extraction use one pattern set per [`MacroKind`].

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;

static MACRO_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!\[CDATA\[|<ac:structured-macro\b[^>]*>|</ac:structured-macro\s*>")
        .expect("macro token pattern")
});

static MACRO_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bac:name="([^"]*)""#).expect("macro name pattern"));

static TITLE_PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<ac:parameter\b[^>]*?\bac:name="title"[^>]*>([^\n]*?)</ac:parameter>"#)
        .expect("title parameter pattern")
});

static CDATA_PAYLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("cdata pattern"));

static HTML_PAYLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!\[CDATA\[<!--title:([^\n]*?)-->(?:\r?\n)?(.*?)\]\]>")
        .expect("html payload pattern")
});

static RICH_TEXT_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<ac:rich-text-body>(.*)</ac:rich-text-body>").expect("rich text pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MacroKind {
    Code,
    Html,
    Panel,
}

impl MacroKind {
    pub const ALL: [MacroKind; 3] = [MacroKind::Code, MacroKind::Html, MacroKind::Panel];

    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        for kind in Self::ALL {
            if trimmed.eq_ignore_ascii_case(kind.as_str()) {
                return Ok(kind);
            }
        }
        bail!("unsupported macro: {trimmed} (expected code|html|panel)")
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Html => "html",
            Self::Panel => "panel",
        }
    }

    /// Element that opens the block payload; the title parameter must precede it.
    fn body_marker(self) -> &'static str {
        match self {
            Self::Code | Self::Html => "<ac:plain-text-body",
            Self::Panel => "<ac:rich-text-body",
        }
    }
}

/// A located block, borrowed from the body it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroBlock<'a> {
    pub kind: MacroKind,
    pub raw_text: &'a str,
    pub title: &'a str,
    pub inner_content: &'a str,
    /// Byte range of `raw_text` within the scanned body.
    pub span: Range<usize>,
}

/// Lazy iterator over the blocks of one kind in a body, in document order.
///
/// Blocks nested inside an open block of the same kind are held back until
/// the outermost one closes, then released sorted by start offset.
#[derive(Debug, Clone)]
pub struct MacroBlocks<'a> {
    body: &'a str,
    kind: MacroKind,
    cursor: usize,
    open: Vec<OpenMacro>,
    held: Vec<MacroBlock<'a>>,
    ready: VecDeque<MacroBlock<'a>>,
}

#[derive(Debug, Clone, Copy)]
struct OpenMacro {
    start: usize,
    matches_kind: bool,
}

pub fn locate(body: Option<&str>, kind: MacroKind) -> MacroBlocks<'_> {
    MacroBlocks {
        body: body.unwrap_or(""),
        kind,
        cursor: 0,
        open: Vec::new(),
        held: Vec::new(),
        ready: VecDeque::new(),
    }
}

impl MacroBlocks<'_> {
    fn release_held(&mut self) {
        self.held.sort_by_key(|block| block.span.start);
        self.ready.extend(self.held.drain(..));
    }
}

impl<'a> Iterator for MacroBlocks<'a> {
    type Item = MacroBlock<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(block) = self.ready.pop_front() {
                return Some(block);
            }
            if self.cursor >= self.body.len() {
                // Blocks inside an unclosed outer block are still reported.
                if self.held.is_empty() {
                    return None;
                }
                self.release_held();
                continue;
            }
            let Some(token) = MACRO_TOKEN.find_at(self.body, self.cursor) else {
                self.cursor = self.body.len();
                continue;
            };
            self.cursor = token.end();
            let text = token.as_str();

            if text.starts_with("<![CDATA[") {
                match self.body[token.end()..].find("]]>") {
                    Some(offset) => self.cursor = token.end() + offset + 3,
                    None => self.cursor = self.body.len(),
                }
            } else if text.starts_with("</") {
                let Some(open) = self.open.pop() else {
                    continue;
                };
                if !open.matches_kind {
                    continue;
                }
                if let Some(block) = extract_block(self.body, open.start..token.end(), self.kind)
                {
                    self.held.push(block);
                }
                if !self.open.iter().any(|enclosing| enclosing.matches_kind) {
                    self.release_held();
                }
            } else if !text.ends_with("/>") {
                let matches_kind = MACRO_NAME
                    .captures(text)
                    .and_then(|captures| captures.get(1))
                    .is_some_and(|name| name.as_str().eq_ignore_ascii_case(self.kind.as_str()));
                self.open.push(OpenMacro {
                    start: token.start(),
                    matches_kind,
                });
            }
        }
    }
}

fn extract_block(body: &str, span: Range<usize>, kind: MacroKind) -> Option<MacroBlock<'_>> {
    let raw_text = body.get(span.clone())?;
    let (title, inner_content) = match kind {
        MacroKind::Code => {
            let title = first_capture(&TITLE_PARAMETER, parameter_head(raw_text, kind))?;
            let content = first_capture(&CDATA_PAYLOAD, raw_text)?;
            (title, content)
        }
        MacroKind::Html => {
            let captures = HTML_PAYLOAD.captures(raw_text)?;
            (captures.get(1)?.as_str(), captures.get(2)?.as_str())
        }
        MacroKind::Panel => {
            let title = first_capture(&TITLE_PARAMETER, parameter_head(raw_text, kind))?;
            let content = first_capture(&RICH_TEXT_BODY, raw_text)?;
            (title, content)
        }
    };
    Some(MacroBlock {
        kind,
        raw_text,
        title,
        inner_content,
        span,
    })
}

fn parameter_head(raw_text: &str, kind: MacroKind) -> &str {
    match raw_text.find(kind.body_marker()) {
        Some(index) => &raw_text[..index],
        None => raw_text,
    }
}

fn first_capture<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str())
}

pub fn build(kind: MacroKind, title: &str, content: &str) -> String {
    match kind {
        MacroKind::Code => format!(
            "<ac:structured-macro ac:name=\"code\">\
             <ac:parameter ac:name=\"title\">{title}</ac:parameter>\
             <ac:parameter ac:name=\"linenumbers\">true</ac:parameter>\
             <ac:parameter ac:name=\"collapse\">false</ac:parameter>\
             <ac:plain-text-body><![CDATA[{content}]]></ac:plain-text-body>\
             </ac:structured-macro>"
        ),
        MacroKind::Html => format!(
            "<ac:structured-macro ac:name=\"html\">\
             <ac:plain-text-body><![CDATA[<!--title:{title}-->\n{content}]]></ac:plain-text-body>\
             </ac:structured-macro>"
        ),
        MacroKind::Panel => format!(
            "<ac:structured-macro ac:name=\"panel\">\
             <ac:parameter ac:name=\"bgColor\"></ac:parameter>\
             <ac:parameter ac:name=\"titleBGColor\"></ac:parameter>\
             <ac:parameter ac:name=\"title\">{title}</ac:parameter>\
             <ac:parameter ac:name=\"borderStyle\"></ac:parameter>\
             <ac:parameter ac:name=\"borderColor\"></ac:parameter>\
             <ac:parameter ac:name=\"titleColor\"></ac:parameter>\
             <ac:rich-text-body>{content}</ac:rich-text-body>\
             </ac:structured-macro>"
        ),
    }
}
