use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::confluence::{NewPage, PageStore, PageUpdate, RemotePage};
use crate::directives::{AttributeInputs, Directives, PageAttributes, resolve_page_attributes};
use crate::error::{StoreError, is_version_conflict};
use crate::merge::merge;
use crate::runtime::absolutize;
use crate::summary::ChangeSummary;

pub const STDIN_IDENTITY: &str = "STDIN";
pub const DEFAULT_MAX_CONFLICT_RETRIES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    File(PathBuf),
    Stdin,
}

impl UploadSource {
    /// A missing argument or `@` selects stdin.
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg.map(str::trim) {
            None | Some("") | Some("@") => Self::Stdin,
            Some(path) => Self::File(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub identity: String,
    pub content: String,
}

pub fn read_source(source: &UploadSource, cwd: &Path) -> Result<SourceDocument> {
    match source {
        UploadSource::File(path) => read_file_source(&absolutize(path, cwd)),
        UploadSource::Stdin => {
            let mut content = String::new();
            io::stdin()
                .read_to_string(&mut content)
                .context("failed to read stdin")?;
            Ok(SourceDocument {
                identity: STDIN_IDENTITY.to_string(),
                content,
            })
        }
    }
}

pub fn read_file_source(path: &Path) -> Result<SourceDocument> {
    let resolved = match fs::canonicalize(path) {
        Ok(resolved) if resolved.is_file() => resolved,
        _ => bail!("Could not find file {}", path.display()),
    };
    let content = fs::read_to_string(&resolved)
        .with_context(|| format!("failed to read {}", resolved.display()))?;
    Ok(SourceDocument {
        identity: resolved.to_string_lossy().into_owned(),
        content,
    })
}

/// Parse in-file directives and resolve where `document` goes.
pub fn prepare_upload(
    document: &SourceDocument,
    hostname: &str,
    flags: &AttributeInputs,
    config: &AttributeInputs,
) -> Result<PageAttributes> {
    let directives = Directives::parse(&document.content);
    resolve_page_attributes(&document.identity, hostname, &directives, flags, config)
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub force: bool,
    pub max_conflict_retries: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Created,
    Updated,
    NoChange,
}

impl UploadOutcome {
    pub fn message(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::NoChange => "no content change detected.",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub page_id: u64,
    pub title: String,
    pub version: u64,
    pub outcome: UploadOutcome,
    pub changed: bool,
    pub file: String,
    pub labels: Vec<String>,
    pub conflict_retries: usize,
    pub request_count: usize,
    pub summary: ChangeSummary,
}

impl UploadReport {
    /// The one-line result printed after an upload, e.g. `123 Notes updated`.
    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.page_id, self.title, self.outcome.message())
    }
}

/// Local time label used in block titles, e.g. `2024-03-05, 4:07:09pm`.
pub fn now_label() -> String {
    Local::now().format("%Y-%m-%d, %-I:%M:%S%P").to_string()
}

pub fn upload_with_store<A: PageStore>(
    api: &mut A,
    attributes: &PageAttributes,
    content: &str,
    options: &UploadOptions,
    now_label: &str,
) -> Result<UploadReport> {
    let mut existing = find_target_page(api, attributes)?;
    let mut conflict_retries = 0;

    loop {
        let merged = merge(
            &attributes.file,
            existing.as_ref().map(|page| page.body.as_str()),
            content,
            attributes.macro_kind,
            now_label,
        );
        let summary = ChangeSummary::between(merged.previous_content.as_deref(), content);

        let Some(page) = existing.as_ref() else {
            let parent_id = match attributes.parent_id {
                Some(parent_id) => parent_id,
                None => api.space_homepage_id(&attributes.space_key)?,
            };
            let created = api.create_page(&NewPage {
                space_key: attributes.space_key.clone(),
                title: attributes.title.clone(),
                parent_id,
                body: merged.body,
            })?;
            api.add_labels(created.id, &attributes.labels)?;
            info!(page_id = created.id, title = %attributes.title, "page created");
            return Ok(report(
                api,
                attributes,
                &created,
                UploadOutcome::Created,
                merged.changed,
                conflict_retries,
                summary,
            ));
        };

        if !merged.changed && !options.force {
            info!(page_id = page.id, title = %attributes.title, "no content change");
            return Ok(report(
                api,
                attributes,
                page,
                UploadOutcome::NoChange,
                false,
                conflict_retries,
                summary,
            ));
        }

        let update = PageUpdate {
            page_id: page.id,
            space_key: attributes.space_key.clone(),
            title: attributes.title.clone(),
            body: merged.body,
            expected_version: page.version,
            minor_edit: !merged.changed,
        };
        match api.update_page(&update) {
            Ok(updated) => {
                api.add_labels(updated.id, &attributes.labels)?;
                info!(
                    page_id = updated.id,
                    version = updated.version,
                    title = %attributes.title,
                    "page updated"
                );
                return Ok(report(
                    api,
                    attributes,
                    &updated,
                    UploadOutcome::Updated,
                    merged.changed,
                    conflict_retries,
                    summary,
                ));
            }
            Err(error)
                if is_version_conflict(&error)
                    && conflict_retries < options.max_conflict_retries =>
            {
                conflict_retries += 1;
                warn!(
                    page_id = page.id,
                    version = page.version,
                    attempt = conflict_retries,
                    "page changed concurrently; re-fetching and merging again"
                );
                let page_id = page.id;
                existing = Some(
                    api.get_page_by_id(page_id)?
                        .ok_or(StoreError::PageNotFound(page_id))?,
                );
            }
            Err(error) => return Err(error),
        }
    }
}

fn find_target_page<A: PageStore>(
    api: &mut A,
    attributes: &PageAttributes,
) -> Result<Option<RemotePage>> {
    if let Some(page_id) = attributes.page_id {
        debug!(page_id, "looking up page by id");
        let page = api
            .get_page_by_id(page_id)?
            .ok_or(StoreError::PageNotFound(page_id))?;
        return Ok(Some(page));
    }

    let mut candidates = if attributes.title == attributes.query {
        debug!(title = %attributes.title, "looking up page by title");
        api.find_pages_by_title(&attributes.space_key, &attributes.title)?
    } else {
        debug!(query = %attributes.query, "searching for page");
        api.search_pages(&attributes.space_key, &attributes.query)?
    };

    if candidates.len() > 1 {
        return Err(StoreError::AmbiguousPage {
            query: attributes.query.clone(),
            page_ids: candidates.iter().map(|page| page.id).collect(),
        }
        .into());
    }
    Ok(candidates.pop())
}

fn report<A: PageStore>(
    api: &A,
    attributes: &PageAttributes,
    page: &RemotePage,
    outcome: UploadOutcome,
    changed: bool,
    conflict_retries: usize,
    summary: ChangeSummary,
) -> UploadReport {
    UploadReport {
        page_id: page.id,
        title: attributes.title.clone(),
        version: page.version,
        outcome,
        changed,
        file: attributes.file.clone(),
        labels: attributes.labels.clone(),
        conflict_retries,
        request_count: api.request_count(),
        summary,
    }
}
