use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// String-keyed event histogram backing every service/http statistic.
///
/// Serializes as a plain JSON object so stats endpoints and account
/// payloads can embed it directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Counter(HashMap<String, u64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&mut self, key: impl Into<String>) {
        self.inc_by(key, 1);
    }

    pub fn inc_by(&mut self, key: impl Into<String>, n: u64) {
        *self.0.entry(key.into()).or_insert(0) += n;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Entries sorted by count descending (ties by key for a stable
    /// listing), truncated to `n` when given.
    pub fn most_common(&self, n: Option<usize>) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> =
            self.0.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(n) = n {
            entries.truncate(n);
        }
        entries
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for Counter {
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_and_total() {
        let mut c = Counter::new();
        c.inc("a");
        c.inc("a");
        c.inc("b");
        assert_eq!(c.get("a"), 2);
        assert_eq!(c.get("b"), 1);
        assert_eq!(c.get("missing"), 0);
        assert_eq!(c.total(), 3);
    }

    #[test]
    fn most_common_orders_descending() {
        let mut c = Counter::new();
        c.inc_by("x", 1);
        c.inc_by("y", 5);
        c.inc_by("z", 3);
        assert_eq!(
            c.most_common(None),
            vec![
                ("y".to_string(), 5),
                ("z".to_string(), 3),
                ("x".to_string(), 1)
            ]
        );
        assert_eq!(c.most_common(Some(1)), vec![("y".to_string(), 5)]);
    }

    #[test]
    fn serializes_as_object() {
        let mut c = Counter::new();
        c.inc_by("*", 7);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["*"], 7);
    }
}
