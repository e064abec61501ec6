//! In-file directives and page attribute resolution.
//!
//! A directive is a comment-style line such as `## SpaceKey: OPS` or
//! `// Title: Deploy notes`: the first two characters are the same character,
//! followed by optional whitespace and `Key:value`.

use std::collections::BTreeSet;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::config::{UserConfig, split_labels};
use crate::macros::MacroKind;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub title: Option<String>,
    pub query: Option<String>,
    pub space_key: Option<String>,
    pub macro_name: Option<String>,
    pub page_id: Option<String>,
    pub parent_id: Option<String>,
    pub labels: Option<String>,
}

impl Directives {
    pub fn parse(content: &str) -> Self {
        let mut directives = Self::default();
        let mut seen = BTreeSet::new();
        for line in content.lines() {
            let Some((key, value)) = split_directive(line) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            let (name, slot) = match key.as_str() {
                "title" => ("title", &mut directives.title),
                "query" => ("query", &mut directives.query),
                "spacekey" => ("spacekey", &mut directives.space_key),
                "macro" => ("macro", &mut directives.macro_name),
                "pageid" => ("pageid", &mut directives.page_id),
                "parentid" => ("parentid", &mut directives.parent_id),
                "label" | "labels" => ("labels", &mut directives.labels),
                _ => continue,
            };
            // The first line for a key decides it; an empty value means "not set".
            if seen.insert(name) && !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }
        directives
    }
}

fn split_directive(line: &str) -> Option<(&str, &str)> {
    let mut chars = line.chars();
    let first = chars.next()?;
    if chars.next()? != first {
        return None;
    }
    let rest = chars.as_str().trim_start();
    let (key, value) = rest.split_once(':')?;
    if key.is_empty() || !key.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return None;
    }
    Some((key, value.trim()))
}

/// Attribute values supplied by command-line flags or by the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeInputs {
    pub space_key: Option<String>,
    pub title: Option<String>,
    pub query: Option<String>,
    pub macro_name: Option<String>,
    pub page_id: Option<String>,
    pub parent_id: Option<String>,
    pub labels: Vec<String>,
}

impl AttributeInputs {
    pub fn from_config(config: &UserConfig) -> Self {
        Self {
            space_key: config.space_key.clone(),
            title: config.title.clone(),
            query: config.query.clone(),
            macro_name: config.macro_name.clone(),
            page_id: config.page_id.clone(),
            parent_id: config.parent_id.clone(),
            labels: config.labels.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageAttributes {
    pub file: String,
    pub space_key: String,
    pub title: String,
    pub query: String,
    pub macro_kind: MacroKind,
    pub page_id: Option<u64>,
    pub parent_id: Option<u64>,
    pub labels: Vec<String>,
}

/// Resolve the target page for `file`: directive > flag > config file.
pub fn resolve_page_attributes(
    file: &str,
    hostname: &str,
    directives: &Directives,
    flags: &AttributeInputs,
    config: &AttributeInputs,
) -> Result<PageAttributes> {
    let first = |directive: &Option<String>, flag: &Option<String>, file_value: &Option<String>| {
        [directive, flag, file_value]
            .into_iter()
            .flatten()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
            .map(str::to_string)
    };

    let Some(space_key) = first(&directives.space_key, &flags.space_key, &config.space_key) else {
        bail!("SpaceKey is required. Nothing uploaded");
    };
    let title = first(&directives.title, &flags.title, &config.title)
        .unwrap_or_else(|| format!("{hostname}:{file}"));
    let query = first(&directives.query, &flags.query, &config.query)
        .unwrap_or_else(|| title.clone());
    let macro_kind = match first(&directives.macro_name, &flags.macro_name, &config.macro_name) {
        Some(name) => MacroKind::parse(&name)?,
        None => MacroKind::Code,
    };
    let page_id = first(&directives.page_id, &flags.page_id, &config.page_id)
        .map(|value| parse_page_id("PageId", &value))
        .transpose()?;
    let parent_id = first(&directives.parent_id, &flags.parent_id, &config.parent_id)
        .map(|value| parse_page_id("ParentId", &value))
        .transpose()?;
    let labels = match directives.labels.as_deref() {
        Some(raw) => split_labels([raw]),
        None if !flags.labels.is_empty() => split_labels(flags.labels.iter().map(String::as_str)),
        None => split_labels(config.labels.iter().map(String::as_str)),
    };

    Ok(PageAttributes {
        file: file.to_string(),
        space_key,
        title,
        query,
        macro_kind,
        page_id,
        parent_id,
        labels,
    })
}

pub fn parse_page_id(name: &str, value: &str) -> Result<u64> {
    let trimmed = value.trim();
    match trimmed.parse::<u64>() {
        Ok(id) => Ok(id),
        Err(_) => bail!("invalid {name}: '{trimmed}' is not a numeric page id"),
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeInputs, Directives, resolve_page_attributes};
    use crate::macros::MacroKind;

    fn inputs_with_space(space: &str) -> AttributeInputs {
        AttributeInputs {
            space_key: Some(space.to_string()),
            ..AttributeInputs::default()
        }
    }

    #[test]
    fn parse_reads_comment_style_directives() {
        let content = "#!/bin/sh\n## SpaceKey: OPS\n// Title:  Deploy notes  \n--PageId:42\n;;labels: a,b\necho done\n";
        let directives = Directives::parse(content);
        assert_eq!(directives.space_key.as_deref(), Some("OPS"));
        assert_eq!(directives.title.as_deref(), Some("Deploy notes"));
        assert_eq!(directives.page_id.as_deref(), Some("42"));
        assert_eq!(directives.labels.as_deref(), Some("a,b"));
        assert_eq!(directives.query, None);
    }

    #[test]
    fn parse_requires_two_identical_leading_characters() {
        let directives = Directives::parse("#/ Title: nope\n # Title: nope\nTitle: nope\n");
        assert_eq!(directives, Directives::default());
    }

    #[test]
    fn parse_keeps_first_occurrence() {
        let directives = Directives::parse("## TITLE: first\n## title: second\n");
        assert_eq!(directives.title.as_deref(), Some("first"));
    }

    #[test]
    fn empty_first_directive_leaves_the_value_to_flags_and_config() {
        let directives = Directives::parse("## Title:\n## Title: later\n## Labels:\n// Label: x\n");
        assert_eq!(directives.title, None);
        assert_eq!(directives.labels, None);

        let flags = AttributeInputs {
            title: Some("From flag".to_string()),
            ..inputs_with_space("OPS")
        };
        let attributes = resolve_page_attributes(
            "a.txt",
            "host",
            &directives,
            &flags,
            &AttributeInputs::default(),
        )
        .expect("resolve");
        assert_eq!(attributes.title, "From flag");
    }

    #[test]
    fn parse_keeps_colons_inside_values() {
        let directives = Directives::parse("## Query: title:\"a:b\"\n");
        assert_eq!(directives.query.as_deref(), Some("title:\"a:b\""));
    }

    #[test]
    fn defaults_derive_title_and_query_from_host_and_file() {
        let attributes = resolve_page_attributes(
            "/srv/app.conf",
            "web-1",
            &Directives::default(),
            &AttributeInputs::default(),
            &inputs_with_space("OPS"),
        )
        .expect("resolve");
        assert_eq!(attributes.title, "web-1:/srv/app.conf");
        assert_eq!(attributes.query, "web-1:/srv/app.conf");
        assert_eq!(attributes.macro_kind, MacroKind::Code);
        assert_eq!(attributes.page_id, None);
        assert!(attributes.labels.is_empty());
    }

    #[test]
    fn directive_beats_flag_beats_config() {
        let directives = Directives {
            title: Some("From file".to_string()),
            ..Directives::default()
        };
        let flags = AttributeInputs {
            title: Some("From flag".to_string()),
            space_key: Some("FLAG".to_string()),
            macro_name: Some("html".to_string()),
            ..AttributeInputs::default()
        };
        let config = AttributeInputs {
            space_key: Some("CONF".to_string()),
            macro_name: Some("panel".to_string()),
            parent_id: Some("99".to_string()),
            labels: vec!["from-config".to_string()],
            ..AttributeInputs::default()
        };
        let attributes = resolve_page_attributes("a.txt", "host", &directives, &flags, &config)
            .expect("resolve");
        assert_eq!(attributes.title, "From file");
        assert_eq!(attributes.query, "From file");
        assert_eq!(attributes.space_key, "FLAG");
        assert_eq!(attributes.macro_kind, MacroKind::Html);
        assert_eq!(attributes.parent_id, Some(99));
        assert_eq!(attributes.labels, vec!["from-config"]);
    }

    #[test]
    fn directive_labels_replace_flag_labels() {
        let directives = Directives {
            labels: Some(" x, ,y ".to_string()),
            ..Directives::default()
        };
        let flags = AttributeInputs {
            labels: vec!["flag".to_string()],
            ..inputs_with_space("OPS")
        };
        let attributes = resolve_page_attributes(
            "a.txt",
            "host",
            &directives,
            &flags,
            &AttributeInputs::default(),
        )
        .expect("resolve");
        assert_eq!(attributes.labels, vec!["x", "y"]);
    }

    #[test]
    fn missing_space_key_is_rejected() {
        let error = resolve_page_attributes(
            "a.txt",
            "host",
            &Directives::default(),
            &AttributeInputs::default(),
            &AttributeInputs::default(),
        )
        .expect_err("must fail");
        assert_eq!(error.to_string(), "SpaceKey is required. Nothing uploaded");
    }

    #[test]
    fn non_numeric_ids_are_rejected() {
        let directives = Directives {
            page_id: Some("abc".to_string()),
            ..Directives::default()
        };
        let error = resolve_page_attributes(
            "a.txt",
            "host",
            &directives,
            &inputs_with_space("OPS"),
            &AttributeInputs::default(),
        )
        .expect_err("must fail");
        assert!(
            error
                .to_string()
                .contains("invalid PageId: 'abc' is not a numeric page id")
        );
    }

    #[test]
    fn unknown_macro_is_rejected() {
        let flags = AttributeInputs {
            macro_name: Some("noformat".to_string()),
            ..inputs_with_space("OPS")
        };
        let error = resolve_page_attributes(
            "a.txt",
            "host",
            &Directives::default(),
            &flags,
            &AttributeInputs::default(),
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("unsupported macro"));
    }
}
