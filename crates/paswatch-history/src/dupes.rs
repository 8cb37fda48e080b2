use std::collections::{BTreeMap, BTreeSet};

/// Read-only view of the crawler's per-id duplicate-request counters.
/// The classifier consults it, never mutates it.
pub trait DuplicateTracker {
    /// How many duplicate listing entries were suppressed for this
    /// register number during the current run.
    fn filtered_count(&self, external_id: &str) -> i64;
}

/// Tracker for runs without a crawl (replaying an export, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDuplicates;

impl DuplicateTracker for NoDuplicates {
    fn filtered_count(&self, _external_id: &str) -> i64 {
        0
    }
}

/// The crawl driver's request-seen filter. The register lists some
/// studies under several search entries; only the first detail request
/// per id goes out, later ones are suppressed and counted.
#[derive(Debug, Default)]
pub struct RequestSeenFilter {
    seen: BTreeSet<String>,
    filtered: BTreeMap<String, i64>,
}

impl RequestSeenFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when this id has not been requested yet this run; false
    /// marks a suppressed duplicate and bumps its counter.
    pub fn first_request(&mut self, external_id: &str) -> bool {
        if self.seen.insert(external_id.to_string()) {
            true
        } else {
            *self.filtered.entry(external_id.to_string()).or_insert(0) += 1;
            false
        }
    }

    pub fn total_filtered(&self) -> i64 {
        self.filtered.values().sum()
    }

    pub fn filtered_ids(&self) -> impl Iterator<Item = (&str, i64)> {
        self.filtered.iter().map(|(id, count)| (id.as_str(), *count))
    }
}

impl DuplicateTracker for RequestSeenFilter {
    fn filtered_count(&self, external_id: &str) -> i64 {
        self.filtered.get(external_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_requests_are_suppressed_and_counted() {
        let mut filter = RequestSeenFilter::new();
        assert!(filter.first_request("48406"));
        assert!(!filter.first_request("48406"));
        assert!(!filter.first_request("48406"));
        assert!(filter.first_request("50574"));

        assert_eq!(filter.filtered_count("48406"), 2);
        assert_eq!(filter.filtered_count("50574"), 0);
        assert_eq!(filter.total_filtered(), 2);
    }
}
