//! Posting source contracts + careers API, careers HTML and fixture implementations.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fwatch_core::{Posting, PostingDetail};
use fwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "fwatch-adapters";

/// Placeholder substituted with the posting id in detail URL templates.
pub const REQ_ID_PLACEHOLDER: &str = "{req_id}";

/// Cards beyond this are ignored on a single results page.
pub const DEFAULT_MAX_POSTINGS: usize = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding source payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no detail returned for posting {0}")]
    MissingDetail(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Elements whose boundaries separate words in extracted detail text.
const BLOCK_TAGS: &[&str] = &[
    "article", "br", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ol", "p", "section",
    "table", "td", "th", "tr", "ul",
];

#[async_trait]
pub trait PostingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn list_postings(&self) -> Result<Vec<Posting>, SourceError>;

    async fn get_detail(&self, id: &str) -> Result<PostingDetail, SourceError>;
}

pub fn detail_url(template: &str, id: &str) -> String {
    template.replace(REQ_ID_PLACEHOLDER, id)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "req_id must be a string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiPosting {
    #[serde(deserialize_with = "string_or_number")]
    req_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    pub_date: Option<String>,
}

impl From<ApiPosting> for Posting {
    fn from(api: ApiPosting) -> Self {
        Posting {
            id: api.req_id,
            title: api.title.unwrap_or_default(),
            city: api.city.unwrap_or_default(),
            state: api.state.unwrap_or_default(),
            posted_at: api.pub_date,
            url: api.url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiDetail {
    #[serde(default)]
    description: Option<String>,
}

pub fn parse_api_listing(body: &[u8]) -> Result<Vec<Posting>, SourceError> {
    let records: Vec<ApiPosting> = serde_json::from_slice(body)?;
    Ok(records
        .into_iter()
        .filter(|r| {
            let keep = !r.req_id.trim().is_empty();
            if !keep {
                warn!(title = ?r.title, "skipping posting without req_id");
            }
            keep
        })
        .map(Posting::from)
        .collect())
}

pub fn parse_api_detail(id: &str, body: &[u8]) -> Result<PostingDetail, SourceError> {
    let records: Vec<ApiDetail> = serde_json::from_slice(body)?;
    let first = records
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::MissingDetail(id.to_string()))?;
    Ok(PostingDetail {
        id: id.to_string(),
        description: first.description.unwrap_or_default(),
    })
}

/// JSON jobs API: one listing request, one detail request per posting.
#[derive(Debug, Clone)]
pub struct CareersApiSource {
    http: HttpFetcher,
    listing_url: String,
    detail_url_template: String,
}

impl CareersApiSource {
    pub fn new(
        http: HttpFetcher,
        listing_url: impl Into<String>,
        detail_url_template: impl Into<String>,
    ) -> Self {
        Self {
            http,
            listing_url: listing_url.into(),
            detail_url_template: detail_url_template.into(),
        }
    }
}

#[async_trait]
impl PostingSource for CareersApiSource {
    fn source_id(&self) -> &'static str {
        "careers-api"
    }

    async fn list_postings(&self) -> Result<Vec<Posting>, SourceError> {
        let page = self.http.get(&self.listing_url).await?;
        let postings = parse_api_listing(&page.body)?;
        debug!(count = postings.len(), url = %self.listing_url, "parsed api listing");
        Ok(postings)
    }

    async fn get_detail(&self, id: &str) -> Result<PostingDetail, SourceError> {
        let url = detail_url(&self.detail_url_template, id);
        let page = self.http.get(&url).await?;
        parse_api_detail(id, &page.body)
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Message(format!("selector {css}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of `element` with a break at every block boundary, whitespace collapsed.
fn block_text(element: ElementRef<'_>) -> String {
    fn walk(element: ElementRef<'_>, out: &mut String) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => {
                    let block = BLOCK_TAGS.contains(&el.name());
                    if block {
                        out.push(' ');
                    }
                    if let Some(child) = ElementRef::wrap(child) {
                        walk(child, out);
                    }
                    if block {
                        out.push(' ');
                    }
                }
                _ => {}
            }
        }
    }

    let mut out = String::new();
    walk(element, &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve `href` against the page it was found on; absolute hrefs stand alone.
fn resolve_link(base_url: &str, href: &str) -> Option<Url> {
    Url::parse(base_url)
        .and_then(|base| base.join(href))
        .or_else(|_| Url::parse(href))
        .ok()
}

fn req_id(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == "req_id")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// "Posted 3 days ago" / "1 day ago" relative to `fetched_at`; anything else is today.
pub fn posted_date_from_relative(text: &str, fetched_at: DateTime<Utc>) -> String {
    let lower = text.to_lowercase();
    let days = if lower.contains("days ago") {
        lower
            .split_whitespace()
            .find_map(|token| token.parse::<i64>().ok())
            .unwrap_or(0)
    } else if lower.contains("day ago") {
        1
    } else {
        0
    };
    (fetched_at - Duration::days(days)).format("%Y-%m-%d").to_string()
}

fn split_location(location: &str) -> (String, String) {
    match location.rsplit_once(',') {
        Some((city, state)) => (city.trim().to_string(), state.trim().to_string()),
        None => (location.trim().to_string(), String::new()),
    }
}

/// Parse a careers search-results page into postings. Cards whose link carries no
/// `req_id` are skipped.
pub fn parse_listing_html(
    html: &str,
    base_url: &str,
    fetched_at: DateTime<Utc>,
    max_postings: usize,
) -> Result<Vec<Posting>, SourceError> {
    let document = Html::parse_document(html);
    let title_link = selector("h2.Search--results__card__title a")?;
    let location_sel = selector("p.Search--results__card__location")?;
    let posted_sel = selector("div.flex p.text-xs")?;

    let mut postings = Vec::new();
    for link in document.select(&title_link).take(max_postings) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_link(base_url, href) else {
            debug!(href, base_url, "unresolvable card link");
            continue;
        };
        let Some(id) = req_id(&url) else {
            debug!(href, "card without req_id");
            continue;
        };
        // link -> h2 -> card header -> card
        let card = link
            .parent()
            .and_then(|h2| h2.parent())
            .and_then(|header| header.parent())
            .and_then(ElementRef::wrap);
        let location = card
            .and_then(|c| c.select(&location_sel).next())
            .map(element_text)
            .unwrap_or_default();
        let posted_text = card
            .and_then(|c| c.select(&posted_sel).next())
            .map(element_text)
            .unwrap_or_default();
        let (city, state) = split_location(&location);

        postings.push(Posting {
            id,
            title: element_text(link),
            city,
            state,
            posted_at: Some(posted_date_from_relative(&posted_text, fetched_at)),
            url: url.to_string(),
        });
    }
    Ok(postings)
}

/// Text of the `div` that follows the block holding the "Job Description" heading.
pub fn parse_detail_html(id: &str, html: &str) -> Result<PostingDetail, SourceError> {
    let document = Html::parse_document(html);
    let headings = selector("h2")?;
    let heading = document
        .select(&headings)
        .find(|h| element_text(*h) == "Job Description")
        .ok_or_else(|| SourceError::MissingDetail(id.to_string()))?;
    let container = heading
        .parent()
        .into_iter()
        .flat_map(|parent| parent.next_siblings())
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "div")
        .ok_or_else(|| SourceError::MissingDetail(id.to_string()))?;
    Ok(PostingDetail {
        id: id.to_string(),
        description: block_text(container),
    })
}

/// Careers site HTML: a search-results page plus one detail page per posting.
#[derive(Debug, Clone)]
pub struct CareersHtmlSource {
    http: HttpFetcher,
    listing_url: String,
    detail_url_template: String,
    max_postings: usize,
}

impl CareersHtmlSource {
    pub fn new(
        http: HttpFetcher,
        listing_url: impl Into<String>,
        detail_url_template: impl Into<String>,
    ) -> Self {
        Self {
            http,
            listing_url: listing_url.into(),
            detail_url_template: detail_url_template.into(),
            max_postings: DEFAULT_MAX_POSTINGS,
        }
    }

    pub fn with_max_postings(mut self, max_postings: usize) -> Self {
        self.max_postings = max_postings;
        self
    }
}

#[async_trait]
impl PostingSource for CareersHtmlSource {
    fn source_id(&self) -> &'static str {
        "careers-html"
    }

    async fn list_postings(&self) -> Result<Vec<Posting>, SourceError> {
        let page = self.http.get(&self.listing_url).await?;
        let postings = parse_listing_html(&page.text(), &page.final_url, Utc::now(), self.max_postings)?;
        debug!(count = postings.len(), url = %self.listing_url, "parsed html listing");
        Ok(postings)
    }

    async fn get_detail(&self, id: &str) -> Result<PostingDetail, SourceError> {
        let url = detail_url(&self.detail_url_template, id);
        let page = self.http.get(&url).await?;
        parse_detail_html(id, &page.text())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureListing {
    pub postings: Vec<Posting>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

/// Offline source backed by a captured listing; postings without a detail entry fail
/// their detail fetch.
#[derive(Debug, Clone)]
pub struct FixturePostingSource {
    listing: FixtureListing,
}

impl FixturePostingSource {
    pub fn new(listing: FixtureListing) -> Self {
        Self { listing }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let listing = serde_json::from_slice(&body)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(listing))
    }

    pub fn listing(&self) -> &FixtureListing {
        &self.listing
    }
}

#[async_trait]
impl PostingSource for FixturePostingSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn list_postings(&self) -> Result<Vec<Posting>, SourceError> {
        Ok(self.listing.postings.clone())
    }

    async fn get_detail(&self, id: &str) -> Result<PostingDetail, SourceError> {
        self.listing
            .details
            .get(id)
            .map(|description| PostingDetail {
                id: id.to_string(),
                description: description.clone(),
            })
            .ok_or_else(|| SourceError::MissingDetail(id.to_string()))
    }
}
