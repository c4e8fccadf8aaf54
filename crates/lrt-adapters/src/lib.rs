//! Source adapter contract, the configuration-driven selector adapter and
//! captured snapshot bundles.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lrt_core::{EntityKind, RawRecord, LIFECYCLE_COLUMNS};
use lrt_storage::{FetchError, HttpFetcher, Url};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lrt-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn from_html(url: impl Into<String>, html: &str, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            content_type: "text/html".to_string(),
            body: html.as_bytes().to_vec(),
            fetched_at,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces raw snapshot records for one source. Fetching is async; parsing is pure.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> EntityKind;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRules {
    pub row_selector: String,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
    #[serde(default)]
    pub follow: Option<FollowRule>,
    #[serde(default)]
    pub detail: Option<DetailRule>,
}

/// How one field is read from a row. Text content unless `attr` is set;
/// whitespace is always collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    /// Relative to the row; the row itself when absent.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub attr: Option<String>,
    /// Read from the page URL instead of the row.
    #[serde(default)]
    pub from_page_url: bool,
    /// The page fetch date, `%Y-%m-%d`.
    #[serde(default)]
    pub fetched_date: bool,
    /// Keep only the text after the first occurrence of this marker.
    #[serde(default)]
    pub split_after: Option<String>,
    #[serde(default)]
    pub absolute_url: bool,
    #[serde(default)]
    pub query_param: Option<String>,
    /// Zero-based index over non-empty path segments.
    #[serde(default)]
    pub path_segment: Option<usize>,
    /// Drop this prefix when present, e.g. `mailto:`.
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Read every match instead of the first and join them with this separator.
    #[serde(default)]
    pub join: Option<String>,
}

impl FieldRule {
    fn reads_row(&self) -> bool {
        !self.from_page_url && !self.fetched_date
    }

    fn parses_url(&self) -> bool {
        self.absolute_url || self.query_param.is_some() || self.path_segment.is_some()
    }
}

/// Listing pages are index pages: the records live on the linked pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowRule {
    pub link_selector: String,
    #[serde(default)]
    pub href_contains: Option<String>,
}

/// Per-record enrichment: fetch the page named by `url_field` and read
/// `fields` from the whole document. Values only fill fields the listing
/// left blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRule {
    pub url_field: String,
    pub fields: Vec<FieldRule>,
}

#[derive(Debug, Clone)]
pub struct SelectorAdapter {
    source_id: String,
    kind: EntityKind,
    listing_urls: Vec<String>,
    rules: ExtractionRules,
}

impl SelectorAdapter {
    pub fn new(
        source_id: impl Into<String>,
        kind: EntityKind,
        listing_urls: Vec<String>,
        rules: ExtractionRules,
    ) -> Result<Self, AdapterError> {
        let source_id = source_id.into();
        compile_selector(&rules.row_selector)?;
        if let Some(follow) = &rules.follow {
            compile_selector(&follow.link_selector)?;
        }

        let schema = kind.schema();
        let assigned = rules
            .fields
            .iter()
            .map(|rule| rule.field.as_str())
            .chain(rules.constants.keys().map(String::as_str));
        for field in assigned {
            if !schema.has_column(field) || LIFECYCLE_COLUMNS.contains(&field) {
                return Err(AdapterError::Message(format!(
                    "source {source_id}: field `{field}` is not a {kind} column"
                )));
            }
        }
        let detail_fields = rules.detail.iter().flat_map(|detail| {
            detail
                .fields
                .iter()
                .map(|rule| rule.field.as_str())
                .chain(std::iter::once(detail.url_field.as_str()))
        });
        for field in detail_fields {
            if !schema.has_column(field) || LIFECYCLE_COLUMNS.contains(&field) {
                return Err(AdapterError::Message(format!(
                    "source {source_id}: detail field `{field}` is not a {kind} column"
                )));
            }
        }
        let all_rules = rules
            .fields
            .iter()
            .chain(rules.detail.iter().flat_map(|detail| detail.fields.iter()));
        for rule in all_rules {
            if let Some(selector) = &rule.selector {
                compile_selector(selector)?;
            }
        }

        Ok(Self {
            source_id,
            kind,
            listing_urls,
            rules,
        })
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchedPage, AdapterError> {
        let response = http.fetch_bytes(ctx.run_id, &self.source_id, url).await?;
        Ok(FetchedPage {
            url: response.final_url,
            content_type: response
                .content_type
                .unwrap_or_else(|| "text/html".to_string()),
            body: response.body,
            fetched_at: ctx.fetched_at,
        })
    }

    /// Fetch each record's detail page and fill blank fields from it. A
    /// failed detail fetch is logged and leaves that record as listed.
    /// Returns the pages fetched, for archiving.
    pub async fn enrich_details(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        records: &mut [RawRecord],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let Some(detail) = &self.rules.detail else {
            return Ok(Vec::new());
        };
        let mut pages = Vec::new();
        for record in records.iter_mut() {
            let url = record.get(&detail.url_field).filter(|u| !u.trim().is_empty());
            let Some(url) = url.cloned() else {
                continue;
            };
            let page = match self.fetch_page(http, ctx, &url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source_id = %self.source_id, %url, error = %err, "detail page unavailable");
                    continue;
                }
            };
            let filled = self.apply_detail_page(record, &page)?;
            debug!(source_id = %self.source_id, %url, filled, "detail page applied");
            pages.push(page);
        }
        Ok(pages)
    }

    /// Fill blank fields of `record` from a fetched detail page. Returns how
    /// many fields were filled.
    pub fn apply_detail_page(
        &self,
        record: &mut RawRecord,
        page: &FetchedPage,
    ) -> Result<usize, AdapterError> {
        let Some(detail) = &self.rules.detail else {
            return Ok(0);
        };
        let selectors = compile_field_selectors(&detail.fields)?;
        let page_url = Url::parse(&page.url).ok();
        let document = Html::parse_document(&page.text());
        let root = document.root_element();

        let mut filled = 0;
        for (rule, selector) in detail.fields.iter().zip(&selectors) {
            let blank = record.get(&rule.field).map_or(true, |v| v.trim().is_empty());
            if !blank {
                continue;
            }
            let value = extract_field(rule, selector.as_ref(), root, page, page_url.as_ref());
            if let Some(value) = value {
                record.insert(rule.field.clone(), value);
                filled += 1;
            }
        }
        Ok(filled)
    }
}

#[async_trait]
impl SourceAdapter for SelectorAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::new();
        let mut followed = BTreeSet::new();
        for url in &self.listing_urls {
            let listing = self.fetch_page(http, ctx, url).await?;
            let Some(follow) = &self.rules.follow else {
                pages.push(listing);
                continue;
            };
            let links = follow_links(&listing, follow)?;
            debug!(source_id = %self.source_id, url = %listing.url, links = links.len(), "following listing links");
            for link in links {
                if followed.insert(link.clone()) {
                    pages.push(self.fetch_page(http, ctx, &link).await?);
                }
            }
        }
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        let rows = compile_selector(&self.rules.row_selector)?;
        let field_selectors = compile_field_selectors(&self.rules.fields)?;
        let page_url = Url::parse(&page.url).ok();
        let document = Html::parse_document(&page.text());

        let mut records = Vec::new();
        for row in document.select(&rows) {
            let mut record = RawRecord::new();
            let mut row_has_values = false;
            for (rule, selector) in self.rules.fields.iter().zip(&field_selectors) {
                if let Some(value) = extract_field(rule, selector.as_ref(), row, page, page_url.as_ref()) {
                    row_has_values |= rule.reads_row();
                    record.insert(rule.field.clone(), value);
                }
            }
            // header and spacer rows
            if !row_has_values {
                continue;
            }
            for (field, value) in &self.rules.constants {
                record
                    .entry(field.clone())
                    .or_insert_with(|| value.clone());
            }
            records.push(record);
        }
        Ok(records)
    }
}

/// Absolute URLs of matching links, in document order without repeats.
pub fn follow_links(page: &FetchedPage, follow: &FollowRule) -> Result<Vec<String>, AdapterError> {
    let selector = compile_selector(&follow.link_selector)?;
    let base = Url::parse(&page.url).ok();
    let document = Html::parse_document(&page.text());

    let mut seen = BTreeSet::new();
    let mut links = Vec::new();
    for href in document.select(&selector).filter_map(|n| n.value().attr("href")) {
        if let Some(needle) = &follow.href_contains {
            if !href.contains(needle.as_str()) {
                continue;
            }
        }
        let Some(url) = resolve_url(base.as_ref(), href.trim()) else {
            continue;
        };
        let url = url.to_string();
        if seen.insert(url.clone()) {
            links.push(url);
        }
    }
    Ok(links)
}

fn compile_field_selectors(rules: &[FieldRule]) -> Result<Vec<Option<Selector>>, AdapterError> {
    rules
        .iter()
        .map(|rule| rule.selector.as_deref().map(compile_selector).transpose())
        .collect()
}

fn compile_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn extract_field(
    rule: &FieldRule,
    selector: Option<&Selector>,
    row: ElementRef<'_>,
    page: &FetchedPage,
    page_url: Option<&Url>,
) -> Option<String> {
    if rule.fetched_date {
        return Some(page.fetched_at.date_naive().format("%Y-%m-%d").to_string());
    }
    if rule.from_page_url {
        return finish_value(rule, &page.url, page_url);
    }

    match (&rule.join, selector) {
        (Some(separator), Some(selector)) => {
            let parts: Vec<String> = row
                .select(selector)
                .filter_map(|element| read_element(rule, element))
                .filter_map(|raw| finish_value(rule, &raw, page_url))
                .collect();
            text_or_none(parts.join(separator.as_str()))
        }
        _ => {
            let element = match selector {
                Some(selector) => row.select(selector).next()?,
                None => row,
            };
            finish_value(rule, &read_element(rule, element)?, page_url)
        }
    }
}

fn read_element(rule: &FieldRule, element: ElementRef<'_>) -> Option<String> {
    match &rule.attr {
        Some(attr) => element.value().attr(attr).map(str::to_string),
        None => Some(element.text().collect()),
    }
}

fn finish_value(rule: &FieldRule, raw: &str, page_url: Option<&Url>) -> Option<String> {
    let mut value = collapse_whitespace(raw);
    if let Some(prefix) = &rule.strip_prefix {
        if let Some(rest) = value.strip_prefix(prefix.as_str()) {
            value = rest.trim().to_string();
        }
    }
    if let Some(marker) = &rule.split_after {
        value = value.split_once(marker.as_str())?.1.trim().to_string();
    }
    if rule.parses_url() {
        let url = resolve_url(page_url, &value)?;
        value = if let Some(param) = &rule.query_param {
            url.query_pairs()
                .find(|(name, _)| name == param.as_str())
                .map(|(_, v)| v.into_owned())?
        } else if let Some(index) = rule.path_segment {
            url.path_segments()?
                .filter(|segment| !segment.is_empty())
                .nth(index)?
                .to_string()
        } else {
            url.to_string()
        };
    }
    text_or_none(value)
}

fn resolve_url(base: Option<&Url>, value: &str) -> Option<Url> {
    match base {
        Some(base) => base.join(value).ok(),
        None => Url::parse(value).ok(),
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// A captured snapshot: the raw records one source produced at one time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub source_id: String,
    pub kind: EntityKind,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

pub fn load_snapshot_bundle(path: impl AsRef<Path>) -> Result<SnapshotBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Run the adapter's parser over fetched pages and package the result.
pub fn bundle_from_pages(
    adapter: &dyn SourceAdapter,
    pages: &[FetchedPage],
    fetched_at: DateTime<Utc>,
) -> Result<SnapshotBundle, AdapterError> {
    let mut records = Vec::new();
    for page in pages {
        let parsed = adapter.parse(page)?;
        debug!(source_id = adapter.source_id(), url = %page.url, records = parsed.len(), "parsed page");
        records.extend(parsed);
    }
    Ok(SnapshotBundle {
        source_id: adapter.source_id().to_string(),
        kind: adapter.kind(),
        captured_from_url: pages
            .first()
            .map(|p| p.url.clone())
            .unwrap_or_default(),
        fetched_at,
        records,
    })
}
