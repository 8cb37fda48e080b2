//! Source adapter contracts and the page parsers for the two catalogue
//! sites. Fetching belongs to the crawl driver; adapters only describe
//! requests and turn fetched HTML into records.

use paswatch_core::{Record, RecordError, SourceSchema};
use scraper::{ElementRef, Selector};
use thiserror::Error;

mod ema_rwd;
mod eupas;
pub mod serialize;

pub use ema_rwd::EmaRwdAdapter;
pub use eupas::EuPasAdapter;

pub const CRATE_NAME: &str = "paswatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("{what} not found on {url}")]
    MissingData { what: &'static str, url: String },
    #[error("unparseable {what} {value:?} on {url}")]
    BadValue {
        what: &'static str,
        value: String,
        url: String,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A request the crawl driver should issue next. The EU PAS search
/// endpoint only answers form POSTs, everything else is a plain GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Get { url: String },
    PostForm { url: String, body: String },
}

impl PageRequest {
    pub fn url(&self) -> &str {
        match self {
            PageRequest::Get { url } => url,
            PageRequest::PostForm { url, .. } => url,
        }
    }
}

/// One study row of a listing page, already field-normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub register_number: String,
    pub state: String,
    pub title: String,
    /// ISO-8601, converted from the site's dd/mm/yyyy.
    pub update_date: String,
    pub detail_url: String,
}

#[derive(Debug, Clone)]
pub struct ListingPage {
    /// Total study count announced by the site, when the page carries one.
    pub expected_total: Option<i64>,
    pub rows: Vec<ListingRow>,
    pub next: Option<PageRequest>,
}

/// Risk management plan category filter, with the per-site query values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmpCategory {
    NotApplicable,
    Category1,
    Category2,
    Category3,
    NonEu,
}

/// Optional crawl narrowing: a single register number or an RMP category.
#[derive(Debug, Clone, Default)]
pub struct StudyFilter {
    pub register_number: Option<String>,
    pub rmp_category: Option<RmpCategory>,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn schema(&self) -> &'static SourceSchema;

    /// The request that opens the crawl, honoring the filter.
    fn initial_request(&self, filter: &StudyFilter) -> PageRequest;

    fn parse_listing(&self, page_url: &str, html: &str) -> Result<ListingPage, AdapterError>;

    fn parse_detail(&self, html: &str, row: &ListingRow) -> Result<Record, AdapterError>;
}

pub fn adapter_for(source_id: &str) -> Option<&'static dyn SourceAdapter> {
    match source_id {
        "eu_pas" => Some(&EuPasAdapter),
        "ema_rwd" => Some(&EmaRwdAdapter),
        _ => None,
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|_| AdapterError::Selector(selector.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = collapse_whitespace(&value);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Joins an element's text nodes and collapses runs of whitespace, the
/// usual cleanup for markup with stray newlines and indentation.
fn element_text(element: ElementRef) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn select_first_text(scope: ElementRef, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope.select(&sel).next().and_then(element_text))
}

fn select_all_texts(scope: ElementRef, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

fn select_first_attr(
    scope: ElementRef,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|element| element.value().attr(attr))
        .and_then(|value| text_or_none(value.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn adapter_registry_resolves_known_sources() {
        assert_eq!(adapter_for("eu_pas").map(|a| a.source_id()), Some("eu_pas"));
        assert_eq!(
            adapter_for("ema_rwd").map(|a| a.source_id()),
            Some("ema_rwd")
        );
        assert!(adapter_for("who_ictrp").is_none());
    }

    #[test]
    fn element_text_collapses_markup_whitespace() {
        let html = Html::parse_fragment("<p>  A\n   study\t title </p>");
        let sel = Selector::parse("p").expect("selector");
        let element = html.select(&sel).next().expect("p element");
        assert_eq!(element_text(element).as_deref(), Some("A study title"));
    }
}
