//! Per-endpoint metric name allow-lists.

use std::collections::{HashMap, HashSet};

/// Immutable index of which metric names each scrape endpoint may forward.
///
/// Endpoints without an entry forward everything. An endpoint listed with
/// an empty set forwards nothing.
#[derive(Debug, Clone, Default)]
pub struct FilterIndex {
    allowed: HashMap<String, HashSet<String>>,
}

impl FilterIndex {
    /// Build from an endpoint → metric names mapping. Duplicate names collapse.
    pub fn new(include_filter: &HashMap<String, Vec<String>>) -> Self {
        let allowed = include_filter
            .iter()
            .map(|(endpoint, names)| (endpoint.clone(), names.iter().cloned().collect()))
            .collect();
        Self { allowed }
    }

    /// Whether `metric_name` may be forwarded for `endpoint`.
    pub fn allows(&self, endpoint: &str, metric_name: &str) -> bool {
        match self.allowed.get(endpoint) {
            Some(names) => names.contains(metric_name),
            None => true,
        }
    }

    /// Resolve the filter for a scrape target.
    ///
    /// An entry for the target address takes precedence over one for the job name.
    pub fn allows_target(&self, job: &str, instance: &str, metric_name: &str) -> bool {
        if self.is_filtered(instance) {
            self.allows(instance, metric_name)
        } else {
            self.allows(job, metric_name)
        }
    }

    /// Whether `endpoint` has an explicit allow-list.
    pub fn is_filtered(&self, endpoint: &str) -> bool {
        self.allowed.contains_key(endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, &[&str])]) -> FilterIndex {
        let map = entries
            .iter()
            .map(|(e, names)| (e.to_string(), names.iter().map(|n| n.to_string()).collect()))
            .collect();
        FilterIndex::new(&map)
    }

    #[test]
    fn unknown_endpoint_allows_everything() {
        let filter = index(&[("job1", &["up"])]);
        for name in ["up", "scrape_duration_seconds", "anything", ""] {
            assert!(filter.allows("other", name), "{name} should pass");
        }
    }

    #[test]
    fn listed_endpoint_allows_only_listed_names() {
        let filter = index(&[("job1", &["up", "go_goroutines"])]);
        assert!(filter.allows("job1", "up"));
        assert!(filter.allows("job1", "go_goroutines"));
        assert!(!filter.allows("job1", "scrape_duration_seconds"));
        assert!(!filter.allows("job1", "UP"));
    }

    #[test]
    fn empty_list_rejects_everything() {
        // An explicit empty allow-list silently drops every metric for that endpoint.
        let filter = index(&[("muted", &[])]);
        assert!(filter.is_filtered("muted"));
        assert!(!filter.allows("muted", "up"));
        assert!(!filter.allows("muted", ""));
    }

    #[test]
    fn empty_index_allows_everything() {
        let filter = FilterIndex::new(&HashMap::new());
        assert!(filter.is_empty());
        assert!(filter.allows("job1", "up"));
        assert!(filter.allows_target("job1", "localhost:9090", "up"));
    }

    #[test]
    fn target_address_entry_wins_over_job_entry() {
        let filter = index(&[("job1", &["up"]), ("localhost:9100", &["node_load1"])]);

        assert!(filter.allows_target("job1", "localhost:9100", "node_load1"));
        assert!(!filter.allows_target("job1", "localhost:9100", "up"));

        // Other targets of the job fall back to the job entry.
        assert!(filter.allows_target("job1", "localhost:9200", "up"));
        assert!(!filter.allows_target("job1", "localhost:9200", "node_load1"));

        // Unfiltered job, unfiltered address.
        assert!(filter.allows_target("job2", "localhost:9300", "anything"));
    }
}
