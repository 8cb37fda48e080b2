use std::collections::BTreeSet;
use std::path::PathBuf;

use paswatch_core::{Record, RunStats, SourceSchema};
use paswatch_storage::{SnapshotError, SnapshotStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::changelog::write_changelog;
use crate::classify::{classify, ChangeEntry, ClassifierPolicy, HistoryError};
use crate::dupes::DuplicateTracker;
use crate::metafield::FieldGrouper;

pub const STAT_DUPLICATE_DROPPED: &str = "pipeline/duplicate_dropped_count";
pub const STAT_INVALID_RECORD: &str = "schema/invalid_record_count";
pub const STAT_RECORD: &str = "pipeline/record_count";

/// History feature configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Prior-run corpus; required when the feature is on.
    pub snapshot_path: Option<PathBuf>,
    pub changelog_path: PathBuf,
    pub date_field: String,
    pub duplicate_allowed_fields: BTreeSet<String>,
    pub excepted_fields: BTreeSet<String>,
    pub meta_field_exclusion: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_path: Some(PathBuf::from("compare.json")),
            changelog_path: PathBuf::from("updates.json"),
            date_field: "update_date".to_string(),
            duplicate_allowed_fields: BTreeSet::new(),
            excepted_fields: BTreeSet::new(),
            meta_field_exclusion: false,
        }
    }
}

impl HistoryConfig {
    /// Environment-driven defaults; the CLI layers its flags on top.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("PASWATCH_HISTORY_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.enabled),
            snapshot_path: std::env::var("PASWATCH_HISTORY_INPUT")
                .map(PathBuf::from)
                .ok()
                .or(defaults.snapshot_path),
            changelog_path: std::env::var("PASWATCH_HISTORY_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.changelog_path),
            date_field: defaults.date_field,
            duplicate_allowed_fields: std::env::var("PASWATCH_HISTORY_DUPLICATE_ALLOWED")
                .map(|v| parse_field_set(&v))
                .unwrap_or_default(),
            excepted_fields: std::env::var("PASWATCH_HISTORY_EXCEPTED")
                .map(|v| parse_field_set(&v))
                .unwrap_or_default(),
            meta_field_exclusion: std::env::var("PASWATCH_METAFIELD_EXCLUDE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.meta_field_exclusion),
        }
    }
}

fn parse_field_set(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("history comparison is enabled but no input snapshot path is configured")]
    MissingSnapshotPath,
    #[error("history comparison is enabled but the snapshot at {path} cannot be loaded")]
    SnapshotUnreadable {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },
}

/// The change-detection engine of one run: prior snapshot, policy and
/// the in-memory change accumulator, flushed exactly once on idle.
#[derive(Debug)]
pub struct HistoryEngine {
    policy: ClassifierPolicy,
    snapshot: SnapshotStore,
    changelog_path: PathBuf,
    entries: Vec<ChangeEntry>,
}

impl HistoryEngine {
    /// Builds the engine, or `None` when the feature is off. Startup
    /// fails here when the feature is on without a loadable snapshot.
    pub fn from_config(config: &HistoryConfig) -> Result<Option<Self>, ConfigError> {
        if !config.enabled {
            return Ok(None);
        }
        let path = config
            .snapshot_path
            .as_ref()
            .ok_or(ConfigError::MissingSnapshotPath)?;
        let snapshot =
            SnapshotStore::load(path).map_err(|source| ConfigError::SnapshotUnreadable {
                path: path.clone(),
                source,
            })?;
        info!(
            snapshot = %path.display(),
            prior_records = snapshot.len(),
            "history comparison enabled"
        );
        Ok(Some(Self {
            policy: ClassifierPolicy {
                date_field: config.date_field.clone(),
                duplicate_allowed_fields: config.duplicate_allowed_fields.clone(),
                excepted_fields: config.excepted_fields.clone(),
                exclude_meta_fields: config.meta_field_exclusion,
            },
            snapshot,
            changelog_path: config.changelog_path.clone(),
            entries: Vec::new(),
        }))
    }

    pub fn with_snapshot(
        snapshot: SnapshotStore,
        policy: ClassifierPolicy,
        changelog_path: PathBuf,
    ) -> Self {
        Self {
            policy,
            snapshot,
            changelog_path,
            entries: Vec::new(),
        }
    }

    pub fn record_scraped(
        &mut self,
        record: &Record,
        duplicates: &dyn DuplicateTracker,
        stats: &mut RunStats,
    ) -> Result<(), HistoryError> {
        if let Some(entry) = classify(record, &self.snapshot, duplicates, stats, &self.policy)? {
            debug!(
                external_id = %entry.external_id,
                changed = entry.changed_fields.len(),
                deleted = entry.deleted_fields.len(),
                "record changed since last run"
            );
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Flushes the accumulator. Returns the changelog path when a file
    /// was written, `None` when nothing changed this run.
    pub fn finish(&self) -> Result<Option<PathBuf>, HistoryError> {
        if write_changelog(&self.entries, &self.changelog_path)? {
            Ok(Some(self.changelog_path.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }
}

/// What became of one scraped record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapedDisposition {
    Accepted,
    DroppedDuplicate,
    DroppedInvalid,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub changelog_path: Option<PathBuf>,
    pub change_entry_count: usize,
    pub record_count: usize,
}

/// One run's item pipeline. Hooks are called by the crawl driver (or a
/// replay) one at a time: `on_item_scraped` per record, `on_idle` once
/// at the end. Aborting a run before idle writes nothing.
#[derive(Debug)]
pub struct RunPipeline {
    schema: &'static SourceSchema,
    history: Option<HistoryEngine>,
    grouper: Option<FieldGrouper>,
    scraped_ids: BTreeSet<String>,
    stats: RunStats,
    records: Vec<Record>,
}

impl RunPipeline {
    pub fn new(
        schema: &'static SourceSchema,
        history: Option<HistoryEngine>,
        grouper: Option<FieldGrouper>,
    ) -> Self {
        Self {
            schema,
            history,
            grouper,
            scraped_ids: BTreeSet::new(),
            stats: RunStats::new(),
            records: Vec::new(),
        }
    }

    pub fn on_item_scraped(
        &mut self,
        mut record: Record,
        duplicates: &dyn DuplicateTracker,
    ) -> Result<ScrapedDisposition, HistoryError> {
        let external_id = record.external_id().to_string();
        if !self.scraped_ids.insert(external_id.clone()) {
            warn!(external_id = %external_id, "dropping duplicate item");
            self.stats.inc(STAT_DUPLICATE_DROPPED);
            return Ok(ScrapedDisposition::DroppedDuplicate);
        }

        if let Err(err) = self.schema.validate(&record) {
            warn!(error = %err, "dropping invalid item");
            self.stats.inc(STAT_INVALID_RECORD);
            return Ok(ScrapedDisposition::DroppedInvalid);
        }

        if let Some(grouper) = &mut self.grouper {
            grouper.assign(&mut record);
        }

        if let Some(history) = &mut self.history {
            history.record_scraped(&record, duplicates, &mut self.stats)?;
        }

        self.stats.inc(STAT_RECORD);
        self.records.push(record);
        Ok(ScrapedDisposition::Accepted)
    }

    pub fn on_idle(&mut self) -> Result<RunOutcome, HistoryError> {
        let changelog_path = match &self.history {
            Some(history) => history.finish()?,
            None => None,
        };
        Ok(RunOutcome {
            changelog_path,
            change_entry_count: self
                .history
                .as_ref()
                .map(|history| history.entries().len())
                .unwrap_or(0),
            record_count: self.records.len(),
        })
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.stats
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn schema(&self) -> &'static SourceSchema {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use paswatch_core::eu_pas_schema;
    use tempfile::tempdir;

    use super::*;
    use crate::classify::{STAT_NEW_RECORD, STAT_NO_DATE_CHANGE};
    use crate::dupes::NoDuplicates;

    fn record(json: serde_json::Value) -> Record {
        serde_json::from_value(json).expect("valid record")
    }

    fn full_record(title: &str) -> Record {
        record(serde_json::json!({
            "url": "https://www.encepp.eu/encepp/viewResource.htm?id=48406",
            "eu_pas_register_number": "48406",
            "state": "Ongoing",
            "title": title,
            "update_date": "2023-01-01",
            "registration_date": "2022-05-04",
            "study_type": "Non-interventional study",
            "requested_by_regulator": "No",
            "collaboration_with_research_network": "No",
            "country_type": "National study",
            "countries": ["Germany"],
            "medical_conditions": ["Psoriasis"],
            "age_population": ["Adults (18-44 years)"],
            "sex_population": ["Male", "Female"],
            "number_of_subjects": 1000,
            "uses_established_data_source": "Yes",
            "data_source_types": ["Administrative claims"],
            "scopes": ["Safety"],
            "primary_scope": "Safety",
            "primary_outcomes": ["Serious infections"],
            "secondary_outcomes": ["Mortality"],
            "study_design": ["Cohort"],
            "follow_up": "Yes",
        }))
    }

    fn engine_with_prior(dir: &std::path::Path, prior: serde_json::Value) -> HistoryEngine {
        let records: Vec<Record> = serde_json::from_value(prior).expect("valid records");
        HistoryEngine::with_snapshot(
            SnapshotStore::from_records(records),
            ClassifierPolicy::default(),
            dir.join("updates.json"),
        )
    }

    #[test]
    fn missing_snapshot_path_is_a_config_error() {
        let config = HistoryConfig {
            enabled: true,
            snapshot_path: None,
            ..HistoryConfig::default()
        };
        assert!(matches!(
            HistoryEngine::from_config(&config),
            Err(ConfigError::MissingSnapshotPath)
        ));
    }

    #[test]
    fn unreadable_snapshot_is_a_config_error() {
        let config = HistoryConfig {
            enabled: true,
            snapshot_path: Some(PathBuf::from("/nonexistent/compare.json")),
            ..HistoryConfig::default()
        };
        assert!(matches!(
            HistoryEngine::from_config(&config),
            Err(ConfigError::SnapshotUnreadable { .. })
        ));
    }

    #[test]
    fn disabled_history_builds_no_engine() {
        let config = HistoryConfig {
            enabled: false,
            snapshot_path: None,
            ..HistoryConfig::default()
        };
        assert!(HistoryEngine::from_config(&config)
            .expect("disabled is fine")
            .is_none());
    }

    #[test]
    fn duplicate_items_never_reach_the_classifier() {
        let dir = tempdir().expect("tempdir");
        let engine = engine_with_prior(dir.path(), serde_json::json!([]));
        let mut pipeline = RunPipeline::new(eu_pas_schema(), Some(engine), None);

        let first = pipeline
            .on_item_scraped(full_record("A"), &NoDuplicates)
            .expect("first item");
        let second = pipeline
            .on_item_scraped(full_record("A renamed"), &NoDuplicates)
            .expect("second item");

        assert_eq!(first, ScrapedDisposition::Accepted);
        assert_eq!(second, ScrapedDisposition::DroppedDuplicate);
        assert_eq!(pipeline.stats().get(STAT_DUPLICATE_DROPPED), 1);
        // Only the first item was classified (as new).
        assert_eq!(pipeline.stats().get(STAT_NEW_RECORD), 1);
        assert_eq!(pipeline.records().len(), 1);
    }

    #[test]
    fn invalid_items_are_dropped_and_counted() {
        let mut pipeline = RunPipeline::new(eu_pas_schema(), None, None);
        let invalid = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "missing everything else"
        }));
        let disposition = pipeline
            .on_item_scraped(invalid, &NoDuplicates)
            .expect("drop is not an error");
        assert_eq!(disposition, ScrapedDisposition::DroppedInvalid);
        assert_eq!(pipeline.stats().get(STAT_INVALID_RECORD), 1);
        assert!(pipeline.records().is_empty());
    }

    #[test]
    fn end_to_end_silent_change_writes_a_changelog() {
        let dir = tempdir().expect("tempdir");
        let prior = serde_json::to_value(vec![full_record("A")]).expect("prior json");
        let engine = engine_with_prior(dir.path(), prior);
        let mut pipeline = RunPipeline::new(eu_pas_schema(), Some(engine), None);

        pipeline
            .on_item_scraped(full_record("B"), &NoDuplicates)
            .expect("item accepted");
        let outcome = pipeline.on_idle().expect("idle succeeds");

        assert_eq!(outcome.change_entry_count, 1);
        let path = outcome.changelog_path.expect("changelog written");
        let written = std::fs::read_to_string(path).expect("read changelog");
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&written).expect("valid json");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["external_id"], "48406");
        assert_eq!(parsed[0]["has_date_change"], false);
        assert_eq!(parsed[0]["changed_fields"]["title"], "B");
        assert_eq!(pipeline.stats().get(STAT_NO_DATE_CHANGE), 1);
    }

    #[test]
    fn unchanged_run_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let prior = serde_json::to_value(vec![full_record("A")]).expect("prior json");
        let engine = engine_with_prior(dir.path(), prior);
        let mut pipeline = RunPipeline::new(eu_pas_schema(), Some(engine), None);

        pipeline
            .on_item_scraped(full_record("A"), &NoDuplicates)
            .expect("item accepted");
        let outcome = pipeline.on_idle().expect("idle succeeds");

        assert!(outcome.changelog_path.is_none());
        assert!(!dir.path().join("updates.json").exists());
    }
}
