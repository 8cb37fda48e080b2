use std::collections::BTreeMap;

/// In-memory run statistics counter store.
///
/// Keys follow a `namespace/counter_name` convention and may carry a
/// per-record suffix (`history/new_record_count/48406`). Increments
/// cannot fail; downstream monitors read the final values once the run
/// is over.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    counters: BTreeMap<String, i64>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&mut self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: &str, amount: i64) {
        *self.counters.entry(key.to_string()).or_insert(0) += amount;
    }

    pub fn set(&mut self, key: &str, value: i64) {
        self.counters.insert(key.to_string(), value);
    }

    /// Returns the counter value, 0 when the key was never touched.
    pub fn get(&self, key: &str) -> i64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.counters.iter().map(|(key, value)| (key.as_str(), *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let mut stats = RunStats::new();
        assert_eq!(stats.get("history/new_record_count"), 0);

        stats.inc("history/new_record_count");
        stats.inc("history/new_record_count");
        stats.add("crawl/page_count", 3);
        stats.set("crawl/expected_record_count", 120);

        assert_eq!(stats.get("history/new_record_count"), 2);
        assert_eq!(stats.get("crawl/page_count"), 3);
        assert_eq!(stats.get("crawl/expected_record_count"), 120);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut stats = RunStats::new();
        stats.inc("b");
        stats.inc("a");
        let keys: Vec<_> = stats.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
