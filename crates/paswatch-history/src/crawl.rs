use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use paswatch_adapters::{PageRequest, SourceAdapter, StudyFilter};
use paswatch_storage::{ArtifactStore, FetchedPage, HttpFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dupes::RequestSeenFilter;
use crate::pipeline::RunPipeline;

pub const STAT_PAGE: &str = "crawl/page_count";
pub const STAT_SCRAPED: &str = "crawl/record_count";
pub const STAT_EXPECTED: &str = "crawl/expected_record_count";
pub const STAT_PARSE_ERROR: &str = "crawl/parse_error_count";
pub const STAT_DUPE_FILTERED: &str = "dupefilter/filtered";

#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub source_id: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub records_scraped: usize,
    pub expected_records: Option<i64>,
}

/// Walks a source sequentially: listing pages, then one detail page
/// per fresh register number, feeding each parsed record into the
/// pipeline and firing its idle hook at the end. Item delivery is
/// strictly one at a time.
pub async fn run_crawl(
    adapter: &dyn SourceAdapter,
    fetcher: &HttpFetcher,
    artifacts: Option<&ArtifactStore>,
    filter: &StudyFilter,
    pipeline: &mut RunPipeline,
) -> Result<CrawlSummary> {
    let run_id = Uuid::new_v4();
    let source_id = adapter.source_id();
    let started_at = Utc::now();
    info!(%run_id, source_id, "starting crawl");

    let mut request_filter = RequestSeenFilter::new();
    let mut pages_fetched = 0usize;
    let mut records_scraped = 0usize;
    let mut expected_records = None;

    let mut next = Some(adapter.initial_request(filter));
    while let Some(request) = next.take() {
        let page = fetch(fetcher, source_id, &request)
            .await
            .with_context(|| format!("fetching listing {}", request.url()))?;
        pages_fetched += 1;
        pipeline.stats_mut().inc(STAT_PAGE);
        store_page(artifacts, source_id, &page).await?;

        let listing = adapter.parse_listing(request.url(), &page.body_text())?;
        if let Some(total) = listing.expected_total {
            expected_records = Some(total);
            pipeline.stats_mut().set(STAT_EXPECTED, total);
        }

        for row in &listing.rows {
            if !request_filter.first_request(&row.register_number) {
                debug!(register_number = %row.register_number, "suppressing duplicate detail request");
                pipeline.stats_mut().inc(STAT_DUPE_FILTERED);
                pipeline
                    .stats_mut()
                    .inc(&format!("{STAT_DUPE_FILTERED}/{}", row.register_number));
                continue;
            }

            let detail = fetcher
                .get(source_id, &row.detail_url)
                .await
                .with_context(|| format!("fetching study {}", row.detail_url))?;
            pages_fetched += 1;
            pipeline.stats_mut().inc(STAT_PAGE);
            store_page(artifacts, source_id, &detail).await?;

            match adapter.parse_detail(&detail.body_text(), row) {
                Ok(record) => {
                    records_scraped += 1;
                    pipeline.stats_mut().inc(STAT_SCRAPED);
                    pipeline.on_item_scraped(record, &request_filter)?;
                }
                Err(err) => {
                    warn!(error = %err, url = %row.detail_url, "failed to parse study detail");
                    pipeline.stats_mut().inc(STAT_PARSE_ERROR);
                }
            }
        }

        next = listing.next;
    }

    let finished_at = Utc::now();
    info!(
        %run_id,
        pages_fetched,
        records_scraped,
        duplicates_filtered = request_filter.total_filtered(),
        "crawl finished"
    );

    Ok(CrawlSummary {
        run_id,
        source_id,
        started_at,
        finished_at,
        pages_fetched,
        records_scraped,
        expected_records,
    })
}

async fn fetch(
    fetcher: &HttpFetcher,
    source_id: &str,
    request: &PageRequest,
) -> Result<FetchedPage, paswatch_storage::FetchError> {
    match request {
        PageRequest::Get { url } => fetcher.get(source_id, url).await,
        PageRequest::PostForm { url, body } => fetcher.post_form(source_id, url, body).await,
    }
}

async fn store_page(
    artifacts: Option<&ArtifactStore>,
    source_id: &str,
    page: &FetchedPage,
) -> Result<()> {
    if let Some(store) = artifacts {
        store
            .store_page(page.fetched_at, source_id, "html", &page.body)
            .await
            .with_context(|| format!("storing raw page {}", page.final_url))?;
    }
    Ok(())
}
