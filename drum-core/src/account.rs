use crate::counter::Counter;
use crate::error::RouterError;
use crate::limits::RouteQuota;
use crate::pattern;
use crate::proxy::Proxy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub fn short_uid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn default_group() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountApiMode {
    /// Callers must name the account explicitly.
    Direct,
    /// The account participates in the open scheduling race.
    #[default]
    Drum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CooldownMode {
    Interval,
    Window,
}

/// One step of an INTERVAL cooldown schedule: a plain interval, or the
/// same interval repeated `n` times (`[n, seconds]` on the wire).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScheduleEntry {
    Every(f64),
    Repeat(u32, f64),
}

/// Cooldown parameter union: a scalar interval, or a schedule list.
/// A two-scalar schedule doubles as the `(window_size, period)` pair
/// of WINDOW mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CooldownParam {
    Scalar(f64),
    Schedule(Vec<ScheduleEntry>),
}

impl CooldownParam {
    /// The flat cyclic schedule this parameter describes.
    pub fn expand(&self) -> Vec<f64> {
        match self {
            CooldownParam::Scalar(secs) => vec![*secs],
            CooldownParam::Schedule(entries) => {
                let mut schedule = Vec::new();
                for entry in entries {
                    match entry {
                        ScheduleEntry::Every(secs) => schedule.push(*secs),
                        ScheduleEntry::Repeat(n, secs) => {
                            schedule.extend(std::iter::repeat(*secs).take(*n as usize))
                        }
                    }
                }
                schedule
            }
        }
    }

    /// Total duration of one schedule pass.
    pub fn window(&self) -> f64 {
        self.expand().iter().sum()
    }

    /// `(window_size, period)` when the parameter is a two-scalar
    /// list, as WINDOW mode requires.
    pub fn window_pair(&self) -> Option<(f64, f64)> {
        match self {
            CooldownParam::Schedule(entries) => match entries.as_slice() {
                [ScheduleEntry::Every(size), ScheduleEntry::Every(period)] => {
                    Some((*size, *period))
                }
                _ => None,
            },
            CooldownParam::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Waiting,
    Running,
    Cooldown,
    Frozen,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Allow,
    Deny,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Allow => "allow",
            RuleKind::Deny => "deny",
        }
    }
}

/// Ordered allow/deny route lists. An absent `allow` list admits every
/// path the `deny` list does not reject; an empty one admits nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoutingRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
}

impl RoutingRules {
    pub fn is_empty(&self) -> bool {
        self.allow.is_none() && self.deny.is_none()
    }

    fn list(&self, kind: RuleKind) -> Option<&Vec<String>> {
        match kind {
            RuleKind::Allow => self.allow.as_ref(),
            RuleKind::Deny => self.deny.as_ref(),
        }
    }

    fn list_mut(&mut self, kind: RuleKind) -> &mut Vec<String> {
        let slot = match kind {
            RuleKind::Allow => &mut self.allow,
            RuleKind::Deny => &mut self.deny,
        };
        slot.get_or_insert_with(Vec::new)
    }

    fn patterns(&self) -> impl Iterator<Item = &String> {
        self.allow
            .iter()
            .flatten()
            .chain(self.deny.iter().flatten())
    }
}

/// Flexible timestamp: accepts RFC 3339 strings or epoch seconds,
/// serializes as RFC 3339.
mod flexible_ts {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(Raw::Epoch(secs)) => Ok(DateTime::from_timestamp(
                secs as i64,
                ((secs.fract()) * 1e9) as u32,
            )),
            Some(Raw::Text(text)) => text
                .parse::<DateTime<Utc>>()
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// An upstream API identity: credentials, egress, cost, routing
/// permissions, pacing discipline and daily quotas.
///
/// Exactly one Worker drives an Account while it is registered; the
/// Worker owns the mutable half (rules, usage, stats, timestamps) and
/// the Manager reads it under a brief lock for scheduling decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(default = "short_uid")]
    pub uid: String,

    pub email: String,

    #[serde(default = "default_group")]
    pub group: String,

    pub api_token: String,

    #[serde(default)]
    pub api_mode: AccountApiMode,

    #[serde(default)]
    pub api_cooldown_param: Option<CooldownParam>,

    #[serde(default)]
    pub api_cooldown_mode: Option<CooldownMode>,

    #[serde(default)]
    pub api_routing_rules: RoutingRules,

    /// Scheduling weight; lower is preferred.
    #[serde(default)]
    pub cost: u32,

    #[serde(default, with = "flexible_ts")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, with = "flexible_ts")]
    pub expire_at: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,

    /// Per-route sent/succeed/failed counters.
    #[serde(default)]
    pub req_stats: HashMap<String, Counter>,

    #[serde(default)]
    pub last_status_codes: HashMap<String, Option<u16>>,

    #[serde(default, with = "flexible_ts")]
    pub last_req_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub worker_state: Option<WorkerState>,

    #[serde(default)]
    pub banned: bool,

    #[serde(default)]
    pub proxy: Option<Proxy>,

    #[serde(flatten)]
    pub quota: RouteQuota,

    /// Routing rules as captured at registration, restored by reset.
    #[serde(skip)]
    routing_rules_origin: RoutingRules,

    /// Timed-rule deadlines, purged opportunistically on lookup.
    #[serde(skip)]
    rules_expire: HashMap<(RuleKind, String), Instant>,
}

/// The account registry hands these out: the Worker mutates, the
/// Manager peeks, locks stay short and never cross an await.
pub type SharedAccount = Arc<Mutex<Account>>;

impl Account {
    /// Field validation at the registration boundary.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.email.is_empty() {
            return Err(RouterError::Validation("account email is empty".into()));
        }
        if self.api_token.is_empty() {
            return Err(RouterError::Validation(format!(
                "account {} has no api token",
                self.email
            )));
        }
        for route in self.api_routing_rules.patterns() {
            if route != "*" && !pattern::is_valid(route) {
                return Err(RouterError::Validation(format!(
                    "invalid routing rule pattern: {route}"
                )));
            }
        }
        for route in self.quota.limits.keys() {
            if route != "*" && !pattern::is_valid(route) {
                return Err(RouterError::Validation(format!(
                    "invalid limits pattern: {route}"
                )));
            }
        }
        if self.api_cooldown_param.is_some() != self.api_cooldown_mode.is_some() {
            return Err(RouterError::Validation(format!(
                "account {} must set cooldown mode and param together",
                self.email
            )));
        }
        if self.api_cooldown_mode == Some(CooldownMode::Window) {
            let pair = self.api_cooldown_param.as_ref().and_then(|p| p.window_pair());
            if pair.is_none() {
                return Err(RouterError::Validation(format!(
                    "account {} window cooldown needs a [window_size, period] pair",
                    self.email
                )));
            }
        }
        Ok(())
    }

    /// Resolve the path through the routing rules.
    ///
    /// Returns the matching allow token (a route pattern or `"*"`), or
    /// `None` when the path is denied. Timed rules that expired are
    /// purged before matching; `deny` always wins over `allow`.
    pub fn get_route(&mut self, path: &str) -> Option<String> {
        if self.banned {
            return None;
        }
        if self.api_routing_rules.is_empty() {
            return Some("*".to_string());
        }
        self.refresh_routing_rules();
        for route in self.api_routing_rules.list(RuleKind::Deny).into_iter().flatten() {
            if route == "*" || pattern::matches(route, path) {
                return None;
            }
        }
        match self.api_routing_rules.list(RuleKind::Allow) {
            Some(allowed) => allowed
                .iter()
                .find(|route| *route == "*" || pattern::matches(route, path))
                .cloned(),
            None => Some("*".to_string()),
        }
    }

    /// Insert (or re-insert) a route into the allow or deny list, at
    /// the tail by default, with an optional expiry deadline.
    pub fn add_routing_rule(
        &mut self,
        kind: RuleKind,
        route: &str,
        index: Option<usize>,
        expire: Option<Instant>,
    ) {
        let routes = self.api_routing_rules.list_mut(kind);
        routes.retain(|existing| existing != route);
        match index {
            Some(index) if index < routes.len() => routes.insert(index, route.to_string()),
            _ => routes.push(route.to_string()),
        }
        let key = (kind, route.to_string());
        match expire {
            Some(deadline) => {
                self.rules_expire.insert(key, deadline);
            }
            None => {
                self.rules_expire.remove(&key);
            }
        }
    }

    /// Drop expired timed rules and orphaned deadlines.
    pub fn refresh_routing_rules(&mut self) {
        let now = Instant::now();
        let expired: Vec<(RuleKind, String)> = self
            .rules_expire
            .iter()
            .filter_map(|((kind, route), deadline)| {
                let present = self
                    .api_routing_rules
                    .list(*kind)
                    .is_some_and(|routes| routes.contains(route));
                if !present || *deadline < now {
                    Some((*kind, route.clone()))
                } else {
                    None
                }
            })
            .collect();
        for (kind, route) in expired {
            self.rules_expire.remove(&(kind, route.clone()));
            if let Some(routes) = match kind {
                RuleKind::Allow => self.api_routing_rules.allow.as_mut(),
                RuleKind::Deny => self.api_routing_rules.deny.as_mut(),
            } {
                routes.retain(|existing| *existing != route);
            }
        }
    }

    /// Capture the registration snapshot reset rolls back to.
    pub fn snapshot_routing_rules(&mut self) {
        self.routing_rules_origin = self.api_routing_rules.clone();
    }

    /// Roll accumulated state back to the registration snapshot.
    pub fn reset(&mut self) {
        self.api_routing_rules = self.routing_rules_origin.clone();
        self.rules_expire.clear();
        self.req_stats.clear();
        self.last_status_codes.clear();
        self.last_req_timestamp = None;
        self.quota.reset_usage();
    }

    pub fn limits_exceeded(&self, path: &str) -> bool {
        self.quota.limits_exceeded(path)
    }

    pub fn inc_usage(&mut self, path: &str) {
        self.quota.inc_usage(path);
    }

    /// Seconds until the account expires, when an expiry is known.
    pub fn lifetime(&self) -> Option<i64> {
        self.expire_at
            .map(|expire| (expire - Utc::now()).num_seconds().max(0))
    }

    /// Remaining value of a paid account: the unexpired share of its
    /// cost over its whole paid lifetime.
    pub fn worth(&self) -> Option<f64> {
        let (created, expire) = (self.created_at?, self.expire_at?);
        if self.cost == 0 || created >= expire {
            return None;
        }
        let total = (expire - created).num_seconds() as f64;
        Some(self.lifetime()? as f64 * (self.cost as f64 / total))
    }

    /// Serialized view with the computed fields included.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        value["usage_total"] = serde_json::json!(self.quota.usage_total());
        value["lifetime"] = serde_json::json!(self.lifetime());
        value["worth"] = serde_json::json!(self.worth());
        value
    }
}
