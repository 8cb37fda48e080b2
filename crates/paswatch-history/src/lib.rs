//! Incremental change detection over scraped study records: record
//! normalization, the change classifier, the idle-time changelog
//! writer, and the run pipeline tying them to a crawl.

mod changelog;
mod classify;
mod crawl;
mod dupes;
mod export;
mod metafield;
mod normalize;
mod pipeline;

pub use changelog::{date_change_rank, write_changelog};
pub use classify::{
    classify, ChangeEntry, ClassifierPolicy, HistoryError, STAT_DATE_CHANGE, STAT_DELETED_DATE,
    STAT_DUPLICATE_RELATED, STAT_NEW_RECORD, STAT_NO_DATE_CHANGE, STAT_ONLY_DELETIONS,
    STAT_ONLY_EXCEPTED,
};
pub use crawl::{run_crawl, CrawlSummary};
pub use dupes::{DuplicateTracker, NoDuplicates, RequestSeenFilter};
pub use export::{export_json, export_sqlite, export_xlsx, ExportError};
pub use metafield::{
    clean_name, group_values, FieldGrouper, MATCHED_FIELD_PREFIX, META_FIELD_CHARS,
};
pub use normalize::{is_meta_field, normalize_record};
pub use pipeline::{
    ConfigError, HistoryConfig, HistoryEngine, RunOutcome, RunPipeline, ScrapedDisposition,
    STAT_DUPLICATE_DROPPED, STAT_INVALID_RECORD, STAT_RECORD,
};

pub const CRATE_NAME: &str = "paswatch-history";
