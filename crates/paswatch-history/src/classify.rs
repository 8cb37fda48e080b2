use std::collections::{BTreeMap, BTreeSet};

use paswatch_core::{FieldValue, Record, RunStats};
use paswatch_storage::SnapshotStore;
use serde::Serialize;
use thiserror::Error;

use crate::dupes::DuplicateTracker;
use crate::normalize::normalize_record;

pub const STAT_NEW_RECORD: &str = "history/new_record_count";
pub const STAT_DATE_CHANGE: &str = "history/updated_with_date_change_count";
pub const STAT_DELETED_DATE: &str = "history/updated_with_deleted_date_count";
pub const STAT_NO_DATE_CHANGE: &str = "history/updated_without_date_change_count";
pub const STAT_ONLY_DELETIONS: &str = "history/updated_without_date_change_count/only_deletions";
pub const STAT_DUPLICATE_RELATED: &str =
    "history/updated_without_date_change_count/duplicate_related";
pub const STAT_ONLY_EXCEPTED: &str =
    "history/updated_without_date_change_count/only_excepted_fields";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(
        "snapshot holds {count} records for register number {external_id}; \
         the prior corpus is corrupt"
    )]
    SnapshotConflict { external_id: String, count: usize },
    #[error("writing changelog {path}")]
    ChangelogIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding changelog {path}")]
    ChangelogEncode {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable classification policy, fixed for the duration of a run.
#[derive(Debug, Clone)]
pub struct ClassifierPolicy {
    /// The field whose change marks an update as source-acknowledged.
    pub date_field: String,
    /// Fields whose change alongside a suppressed duplicate request is
    /// considered a benign re-scrape artifact.
    pub duplicate_allowed_fields: BTreeSet<String>,
    /// Fields whose exclusive change is tallied separately for triage.
    pub excepted_fields: BTreeSet<String>,
    pub exclude_meta_fields: bool,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            date_field: "update_date".to_string(),
            duplicate_allowed_fields: BTreeSet::new(),
            excepted_fields: BTreeSet::new(),
            exclude_meta_fields: false,
        }
    }
}

/// The outcome of comparing one freshly scraped record against its
/// prior snapshot counterpart.
///
/// Fields are declared alphabetically so serialized entries keep their
/// keys in a stable, diff-friendly order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEntry {
    /// New values of the fields whose normalized value differs.
    pub changed_fields: BTreeMap<String, FieldValue>,
    /// Fields the source stopped reporting.
    pub deleted_fields: BTreeSet<String>,
    pub external_id: String,
    /// `Some(true)` when the update date moved, `None` when it was
    /// dropped by the source, `Some(false)` for silent changes.
    pub has_date_change: Option<bool>,
    /// The crawl saw duplicate listing entries for this id this run.
    pub is_duplicate_artifact: bool,
    /// Nothing changed, something disappeared.
    pub only_deleted_fields: bool,
    pub url: Option<String>,
}

/// Compares a scraped record against the prior snapshot and classifies
/// the difference, tallying the run counters as it goes.
///
/// Returns `None` for records that are new to the register or
/// unchanged; more than one prior record for an id is a fatal
/// consistency violation, never a silent pick.
pub fn classify(
    record: &Record,
    snapshot: &SnapshotStore,
    duplicates: &dyn DuplicateTracker,
    stats: &mut RunStats,
    policy: &ClassifierPolicy,
) -> Result<Option<ChangeEntry>, HistoryError> {
    let external_id = record.external_id();
    let prior = snapshot.records_for(external_id);
    if prior.is_empty() {
        stats.inc(STAT_NEW_RECORD);
        stats.inc(&format!("{STAT_NEW_RECORD}/{external_id}"));
        return Ok(None);
    }
    if prior.len() > 1 {
        return Err(HistoryError::SnapshotConflict {
            external_id: external_id.to_string(),
            count: prior.len(),
        });
    }

    let new_fields = normalize_record(record, policy.exclude_meta_fields);
    let old_fields = normalize_record(&prior[0], policy.exclude_meta_fields);

    let mut changed_fields = BTreeMap::new();
    for (name, value) in &new_fields {
        if old_fields.get(name) != Some(value) {
            changed_fields.insert(name.clone(), value.clone());
        }
    }
    let deleted_fields: BTreeSet<String> = old_fields
        .keys()
        .filter(|name| !new_fields.contains_key(*name))
        .cloned()
        .collect();

    if changed_fields.is_empty() && deleted_fields.is_empty() {
        return Ok(None);
    }

    let is_duplicate_artifact = duplicates.filtered_count(external_id) > 0;

    let has_date_change = if changed_fields.contains_key(&policy.date_field) {
        stats.inc(STAT_DATE_CHANGE);
        Some(true)
    } else if deleted_fields.contains(&policy.date_field) {
        stats.inc(STAT_DELETED_DATE);
        None
    } else {
        stats.inc(STAT_NO_DATE_CHANGE);
        if changed_fields.is_empty() {
            stats.inc(STAT_ONLY_DELETIONS);
        }
        if !policy.excepted_fields.is_empty()
            && changed_fields
                .keys()
                .chain(deleted_fields.iter())
                .all(|name| policy.excepted_fields.contains(name))
        {
            stats.inc(STAT_ONLY_EXCEPTED);
        }
        if is_duplicate_artifact
            && changed_fields
                .keys()
                .all(|name| policy.duplicate_allowed_fields.contains(name))
        {
            stats.inc(STAT_DUPLICATE_RELATED);
        }
        Some(false)
    };

    let only_deleted_fields = changed_fields.is_empty() && !deleted_fields.is_empty();

    Ok(Some(ChangeEntry {
        changed_fields,
        deleted_fields,
        external_id: external_id.to_string(),
        has_date_change,
        is_duplicate_artifact,
        only_deleted_fields,
        url: record.url().map(str::to_string),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dupes::NoDuplicates;

    struct FixedDuplicates(i64);

    impl DuplicateTracker for FixedDuplicates {
        fn filtered_count(&self, _external_id: &str) -> i64 {
            self.0
        }
    }

    fn record(json: serde_json::Value) -> Record {
        serde_json::from_value(json).expect("valid record")
    }

    fn snapshot(json: serde_json::Value) -> SnapshotStore {
        SnapshotStore::from_records(serde_json::from_value(json).expect("valid records"))
    }

    fn prior_snapshot() -> SnapshotStore {
        snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "title": "A", "update_date": "2023-01-01"}
        ]))
    }

    #[test]
    fn identical_record_produces_nothing() {
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "A", "update_date": "2023-01-01"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &prior_snapshot(),
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds");
        assert!(entry.is_none());
        assert!(stats.is_empty());
    }

    #[test]
    fn list_reordering_is_not_a_change() {
        let store = snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "countries": ["Germany", "France"]}
        ]));
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "countries": ["France", "Germany"]
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &store,
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds");
        assert!(entry.is_none());
    }

    #[test]
    fn unseen_register_number_counts_as_new() {
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "99", "title": "B", "update_date": "2023-01-01"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &prior_snapshot(),
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds");
        assert!(entry.is_none());
        assert_eq!(stats.get(STAT_NEW_RECORD), 1);
        assert_eq!(stats.get("history/new_record_count/99"), 1);
    }

    #[test]
    fn conflicting_prior_records_abort() {
        let store = snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "title": "A"},
            {"eu_pas_register_number": "1", "title": "A again"}
        ]));
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "B"
        }));
        let mut stats = RunStats::new();
        let err = classify(
            &scraped,
            &store,
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect_err("conflict must abort");
        assert!(matches!(
            err,
            HistoryError::SnapshotConflict { count: 2, .. }
        ));
    }

    #[test]
    fn silent_title_change_is_flagged() {
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "B", "update_date": "2023-01-01"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &prior_snapshot(),
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds")
        .expect("change entry");

        assert_eq!(
            entry.changed_fields,
            BTreeMap::from([("title".to_string(), FieldValue::text("B"))])
        );
        assert!(entry.deleted_fields.is_empty());
        assert_eq!(entry.has_date_change, Some(false));
        assert!(!entry.only_deleted_fields);
        assert_eq!(stats.get(STAT_NO_DATE_CHANGE), 1);
        assert_eq!(stats.get(STAT_DATE_CHANGE), 0);
    }

    #[test]
    fn date_bump_rides_along_with_the_change() {
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "B", "update_date": "2023-06-01"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &prior_snapshot(),
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds")
        .expect("change entry");

        assert_eq!(entry.has_date_change, Some(true));
        assert_eq!(
            entry.changed_fields,
            BTreeMap::from([
                ("title".to_string(), FieldValue::text("B")),
                ("update_date".to_string(), FieldValue::text("2023-06-01")),
            ])
        );
        assert_eq!(stats.get(STAT_DATE_CHANGE), 1);
        assert_eq!(stats.get(STAT_NO_DATE_CHANGE), 0);
    }

    #[test]
    fn dropped_update_date_is_the_null_case() {
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "A"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &prior_snapshot(),
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds")
        .expect("change entry");

        assert_eq!(entry.has_date_change, None);
        assert_eq!(
            entry.deleted_fields,
            BTreeSet::from(["update_date".to_string()])
        );
        assert!(entry.only_deleted_fields);
        assert_eq!(stats.get(STAT_DELETED_DATE), 1);
    }

    #[test]
    fn pure_deletion_is_tallied_separately() {
        let store = snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "title": "A", "notes": "x"}
        ]));
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "A"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &store,
            &NoDuplicates,
            &mut stats,
            &ClassifierPolicy::default(),
        )
        .expect("classification succeeds")
        .expect("change entry");

        assert!(entry.changed_fields.is_empty());
        assert_eq!(entry.deleted_fields, BTreeSet::from(["notes".to_string()]));
        assert!(entry.only_deleted_fields);
        assert_eq!(stats.get(STAT_NO_DATE_CHANGE), 1);
        assert_eq!(stats.get(STAT_ONLY_DELETIONS), 1);
    }

    #[test]
    fn duplicate_artifact_needs_the_allowlist() {
        let policy = ClassifierPolicy {
            duplicate_allowed_fields: BTreeSet::from(["url".to_string()]),
            ..ClassifierPolicy::default()
        };
        let store = snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "url": "https://a", "update_date": "2023-01-01"}
        ]));
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "url": "https://b", "update_date": "2023-01-01"
        }));

        let mut stats = RunStats::new();
        let entry = classify(&scraped, &store, &FixedDuplicates(2), &mut stats, &policy)
            .expect("classification succeeds")
            .expect("change entry");
        assert!(entry.is_duplicate_artifact);
        assert_eq!(stats.get(STAT_DUPLICATE_RELATED), 1);

        // The same change without a duplicate signal stays unexplained.
        let mut stats = RunStats::new();
        let entry = classify(&scraped, &store, &NoDuplicates, &mut stats, &policy)
            .expect("classification succeeds")
            .expect("change entry");
        assert!(!entry.is_duplicate_artifact);
        assert_eq!(stats.get(STAT_DUPLICATE_RELATED), 0);
    }

    #[test]
    fn changes_outside_the_allowlist_are_not_duplicate_related() {
        let policy = ClassifierPolicy {
            duplicate_allowed_fields: BTreeSet::from(["url".to_string()]),
            ..ClassifierPolicy::default()
        };
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "title": "B", "update_date": "2023-01-01"
        }));
        let mut stats = RunStats::new();
        let entry = classify(
            &scraped,
            &prior_snapshot(),
            &FixedDuplicates(1),
            &mut stats,
            &policy,
        )
        .expect("classification succeeds")
        .expect("change entry");
        assert!(entry.is_duplicate_artifact);
        assert_eq!(stats.get(STAT_DUPLICATE_RELATED), 0);
    }

    #[test]
    fn excepted_fields_only_drive_their_counter() {
        let policy = ClassifierPolicy {
            excepted_fields: BTreeSet::from(["references".to_string()]),
            ..ClassifierPolicy::default()
        };
        let store = snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "references": ["a"], "update_date": "2023-01-01"}
        ]));
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1", "references": ["b"], "update_date": "2023-01-01"
        }));
        let mut stats = RunStats::new();
        classify(&scraped, &store, &NoDuplicates, &mut stats, &policy)
            .expect("classification succeeds")
            .expect("change entry");
        assert_eq!(stats.get(STAT_ONLY_EXCEPTED), 1);
        assert_eq!(stats.get(STAT_NO_DATE_CHANGE), 1);
    }

    #[test]
    fn meta_fields_are_invisible_when_excluded() {
        let policy = ClassifierPolicy {
            exclude_meta_fields: true,
            ..ClassifierPolicy::default()
        };
        let store = snapshot(serde_json::json!([
            {"eu_pas_register_number": "1", "title": "A", "update_date": "2023-01-01"}
        ]));
        let scraped = record(serde_json::json!({
            "eu_pas_register_number": "1",
            "title": "A",
            "update_date": "2023-01-01",
            "$MATCHED_CENTRE_NAME": "Alpha Pharma"
        }));
        let mut stats = RunStats::new();
        let entry = classify(&scraped, &store, &NoDuplicates, &mut stats, &policy)
            .expect("classification succeeds");
        assert!(entry.is_none());
    }
}
