use crate::account::short_uid;
use crate::limits::RouteQuota;
use serde::{Deserialize, Serialize};

fn default_sub() -> String {
    "base".to_string()
}

/// Per-login quota record, created lazily on the first non-admin
/// request carrying an `x-login` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default = "short_uid")]
    pub uid: String,

    pub login: String,

    #[serde(default = "default_sub")]
    pub sub: String,

    #[serde(default)]
    pub banned: bool,

    #[serde(flatten)]
    pub quota: RouteQuota,
}

impl User {
    pub fn new(login: &str, limits: indexmap::IndexMap<String, u64>) -> Self {
        Self {
            uid: short_uid(),
            login: login.to_string(),
            sub: default_sub(),
            banned: false,
            quota: RouteQuota::new(limits),
        }
    }

    pub fn usage_total(&self) -> u64 {
        self.quota.usage_total()
    }

    /// Serialized view with the computed total included.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        value["usage_total"] = serde_json::json!(self.usage_total());
        value
    }
}
