use crate::counter::Counter;
use crate::pattern;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Daily route quotas shared by accounts and users.
///
/// `limits` maps a route pattern (or `"*"`) to a request budget and is
/// walked in insertion order: the first pattern matching the path
/// decides both the quota check and the usage bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteQuota {
    #[serde(default)]
    pub limits: IndexMap<String, u64>,
    #[serde(default)]
    pub usage: Counter,
}

impl RouteQuota {
    pub fn new(limits: IndexMap<String, u64>) -> Self {
        Self {
            limits,
            usage: Counter::new(),
        }
    }

    pub fn usage_total(&self) -> u64 {
        self.usage.total()
    }

    /// True iff the first matching quota route has been used up.
    /// With no limits configured nothing is ever exceeded.
    pub fn limits_exceeded(&self, path: &str) -> bool {
        for (route, limit) in &self.limits {
            if route == "*" || pattern::matches(route, path) {
                return self.usage.get(route) >= *limit;
            }
        }
        false
    }

    /// Count a request against the bucket the path falls into; the
    /// catch-all bucket absorbs paths no quota route matches.
    pub fn inc_usage(&mut self, path: &str) {
        let route = self
            .limits
            .keys()
            .find(|route| *route == "*" || pattern::matches(route, path))
            .cloned()
            .unwrap_or_else(|| "*".to_string());
        self.usage.inc(route);
    }

    pub fn reset_usage(&mut self) {
        self.usage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(limits: &[(&str, u64)]) -> RouteQuota {
        RouteQuota::new(
            limits
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        )
    }

    #[test]
    fn no_limits_never_exceeded() {
        let mut q = RouteQuota::default();
        assert!(!q.limits_exceeded("/api/wb/foo"));
        q.inc_usage("/api/wb/foo");
        assert_eq!(q.usage.get("*"), 1);
        assert!(!q.limits_exceeded("/api/wb/foo"));
    }

    #[test]
    fn first_matching_route_decides() {
        let mut q = quota(&[(r"^/api/wb", 2), ("*", 100)]);
        assert!(!q.limits_exceeded("/api/wb/foo"));
        q.inc_usage("/api/wb/foo");
        q.inc_usage("/api/wb/bar");
        assert!(q.limits_exceeded("/api/wb/baz"));
        // the catch-all bucket is untouched
        assert_eq!(q.usage.get("*"), 0);
        assert!(!q.limits_exceeded("/api/oz/foo"));
    }

    #[test]
    fn reset_restores_budget() {
        let mut q = quota(&[(r"^/api/wb", 1)]);
        q.inc_usage("/api/wb/foo");
        assert!(q.limits_exceeded("/api/wb/foo"));
        q.reset_usage();
        assert!(!q.limits_exceeded("/api/wb/foo"));
    }

    #[test]
    fn unmatched_path_counts_against_catch_all() {
        let mut q = quota(&[(r"^/api/wb", 5)]);
        q.inc_usage("/api/oz/foo");
        assert_eq!(q.usage.get("*"), 1);
        assert_eq!(q.usage_total(), 1);
    }
}
