use crate::account::{CooldownMode, CooldownParam, RoutingRules, ScheduleEntry};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the Drum router.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Router API behavior (auth, timeouts, user quotas)
    #[serde(default)]
    pub api: ApiConfig,

    /// Upstream (donor account) discipline
    #[serde(default)]
    pub donor: DonorConfig,

    /// Shared key/value store backing the caches
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Shared secret every request must present in `x-token`
    #[serde(default = "default_auth_token")]
    pub auth_token: String,

    /// Overall deadline for one proxied request (seconds)
    #[serde(default = "default_task_timeout")]
    pub task_timeout: f64,

    /// How long the open race waits for a free worker (seconds)
    #[serde(default = "default_workers_timeout")]
    pub workers_timeout: f64,

    /// Per-worker queue bound
    #[serde(default = "default_task_queue_maxsize")]
    pub task_queue_maxsize: usize,

    /// Queue depth that triggers a warning log
    #[serde(default = "default_queue_warning_threshold")]
    pub queue_size_warning_threshold: usize,

    /// Daily quotas applied to new users (route pattern -> budget)
    #[serde(default)]
    pub daily_limits_per_user: IndexMap<String, u64>,

    /// Logins exempt from user quotas (regex list)
    #[serde(default = "default_unlimited_users")]
    pub unlimited_users: Vec<String>,
}

/// One sticky-routing pattern: requests whose path matches `path` are
/// pinned per the listed query params.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindPattern {
    pub path: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonorConfig {
    /// Upstream request timeout (seconds)
    #[serde(default = "default_network_timeout")]
    pub network_timeout: f64,

    /// Retries on connect errors
    #[serde(default = "default_network_retries")]
    pub network_retries: u32,

    /// Statuses that permanently deny the route for the account
    #[serde(default = "default_banned_status_codes")]
    pub banned_status_codes: Vec<u16>,

    /// Statuses that freeze the account and deny the route temporarily
    #[serde(default = "default_freeze_status_codes")]
    pub freeze_status_codes: Vec<u16>,

    /// Throttle-hint response header
    #[serde(default = "default_retry_after_header")]
    pub retry_after_header: Option<String>,

    /// Cap on any throttle-driven deny expiry (seconds)
    #[serde(default = "default_retry_after_max_time")]
    pub retry_after_max_time: Option<f64>,

    /// Fallback used when the throttle hint is unparseable: the denied
    /// endpoint becomes this pattern's match on the response path
    #[serde(default = "default_retry_after_path_fallback_re")]
    pub retry_after_path_fallback_re: String,

    #[serde(default = "default_freeze_time_initial")]
    pub freeze_time_initial: f64,

    #[serde(default = "default_freeze_time_max")]
    pub freeze_time_max: f64,

    #[serde(default = "default_freeze_time_factor")]
    pub freeze_time_factor: f64,

    /// Pacing applied to accounts that do not bring their own
    #[serde(default = "default_cooldown_param")]
    pub api_cooldown_param: CooldownParam,

    #[serde(default = "default_cooldown_mode")]
    pub api_cooldown_mode: CooldownMode,

    #[serde(default = "default_api_scheme")]
    pub api_scheme: String,

    /// Upstream API host; must be set before workers can run
    #[serde(default)]
    pub api_domain: String,

    /// Header carrying the account token upstream
    #[serde(default = "default_api_token_header_name")]
    pub api_token_header_name: String,

    /// Client headers copied to the upstream request
    #[serde(default = "default_passthrough_headers")]
    pub api_passthrough_headers: Vec<String>,

    /// Headers every upstream request starts from
    #[serde(default = "default_api_default_headers")]
    pub api_default_headers: IndexMap<String, String>,

    #[serde(default = "default_true")]
    pub http_cache_enabled: bool,

    /// Response-cache entry bound
    #[serde(default = "default_http_cache_capacity")]
    pub http_cache_capacity: usize,

    /// Bodies above this size are never cached (bytes)
    #[serde(default = "default_http_cache_item_maxsize")]
    pub http_cache_item_maxsize: usize,

    /// Bodies above this size get the short TTL (bytes)
    #[serde(default = "default_http_cache_size_threshold")]
    pub http_cache_size_threshold: usize,

    #[serde(default = "default_http_cache_default_ttl")]
    pub http_cache_default_ttl: f64,

    #[serde(default = "default_http_cache_short_ttl")]
    pub http_cache_short_ttl: f64,

    /// Sticky-routing entry TTL (seconds)
    #[serde(default = "default_bind_requests_cache_ttl")]
    pub bind_requests_cache_ttl: f64,

    #[serde(default = "default_bind_requests_path_re")]
    pub bind_requests_path_re: Vec<BindPattern>,

    /// Routing rules applied to accounts registered without any
    #[serde(default = "default_routing_rules")]
    pub api_default_routing_rules: RoutingRules,

    /// Daily quotas applied to accounts registered without any
    #[serde(default)]
    pub api_daily_limits_per_account: IndexMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,
}

impl RouterConfig {
    /// Load configuration from a YAML file + environment variables.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            // Try default locations
            for default_path in &["drum.yaml", "/etc/drum/drum.yaml", "config/drum.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        // Environment variables override: DRUM_SERVER__PORT, etc.
        figment = figment.merge(Env::prefixed("DRUM_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

// Default implementations

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            auth_token: default_auth_token(),
            task_timeout: default_task_timeout(),
            workers_timeout: default_workers_timeout(),
            task_queue_maxsize: default_task_queue_maxsize(),
            queue_size_warning_threshold: default_queue_warning_threshold(),
            daily_limits_per_user: IndexMap::new(),
            unlimited_users: default_unlimited_users(),
        }
    }
}

impl Default for DonorConfig {
    fn default() -> Self {
        Self {
            network_timeout: default_network_timeout(),
            network_retries: default_network_retries(),
            banned_status_codes: default_banned_status_codes(),
            freeze_status_codes: default_freeze_status_codes(),
            retry_after_header: default_retry_after_header(),
            retry_after_max_time: default_retry_after_max_time(),
            retry_after_path_fallback_re: default_retry_after_path_fallback_re(),
            freeze_time_initial: default_freeze_time_initial(),
            freeze_time_max: default_freeze_time_max(),
            freeze_time_factor: default_freeze_time_factor(),
            api_cooldown_param: default_cooldown_param(),
            api_cooldown_mode: default_cooldown_mode(),
            api_scheme: default_api_scheme(),
            api_domain: String::new(),
            api_token_header_name: default_api_token_header_name(),
            api_passthrough_headers: default_passthrough_headers(),
            api_default_headers: default_api_default_headers(),
            http_cache_enabled: true,
            http_cache_capacity: default_http_cache_capacity(),
            http_cache_item_maxsize: default_http_cache_item_maxsize(),
            http_cache_size_threshold: default_http_cache_size_threshold(),
            http_cache_default_ttl: default_http_cache_default_ttl(),
            http_cache_short_ttl: default_http_cache_short_ttl(),
            bind_requests_cache_ttl: default_bind_requests_cache_ttl(),
            bind_requests_path_re: default_bind_requests_path_re(),
            api_default_routing_rules: default_routing_rules(),
            api_daily_limits_per_account: IndexMap::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
        }
    }
}

// Serde default functions

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_auth_token() -> String {
    "auth".to_string()
}

fn default_task_timeout() -> f64 {
    90.0
}

fn default_workers_timeout() -> f64 {
    30.0
}

fn default_task_queue_maxsize() -> usize {
    25
}

fn default_queue_warning_threshold() -> usize {
    10
}

fn default_unlimited_users() -> Vec<String> {
    vec![r"^cache".to_string(), r"^admin".to_string()]
}

fn default_network_timeout() -> f64 {
    60.0
}

fn default_network_retries() -> u32 {
    1
}

fn default_banned_status_codes() -> Vec<u16> {
    vec![403]
}

fn default_freeze_status_codes() -> Vec<u16> {
    vec![429]
}

fn default_retry_after_header() -> Option<String> {
    Some("retry-after".to_string())
}

fn default_retry_after_max_time() -> Option<f64> {
    Some(60.0 * 60.0) // 1h
}

fn default_retry_after_path_fallback_re() -> String {
    r"^\D*".to_string()
}

fn default_freeze_time_initial() -> f64 {
    5.0
}

fn default_freeze_time_max() -> f64 {
    60.0
}

fn default_freeze_time_factor() -> f64 {
    2.0
}

fn default_cooldown_param() -> CooldownParam {
    // not more than 1 req per 5 sec for 30 sec in a row
    CooldownParam::Schedule(vec![ScheduleEntry::Every(5.0), ScheduleEntry::Every(30.0)])
}

fn default_cooldown_mode() -> CooldownMode {
    CooldownMode::Window
}

fn default_api_scheme() -> String {
    "https".to_string()
}

fn default_api_token_header_name() -> String {
    "x-api-token".to_string()
}

fn default_passthrough_headers() -> Vec<String> {
    vec!["content-type".to_string(), "content-encoding".to_string()]
}

fn default_api_default_headers() -> IndexMap<String, String> {
    IndexMap::from_iter([
        ("user-agent".to_string(), "curl/7.81.0".to_string()),
        ("content-type".to_string(), "application/json".to_string()),
    ])
}

fn default_http_cache_capacity() -> usize {
    30_000 // items
}

fn default_http_cache_item_maxsize() -> usize {
    15 * 1024 * 1024 // 15MiB
}

fn default_http_cache_size_threshold() -> usize {
    5 * 1024 * 1024 // 5MiB
}

fn default_http_cache_default_ttl() -> f64 {
    60.0 * 60.0 * 24.0 // 24h
}

fn default_http_cache_short_ttl() -> f64 {
    60.0 * 60.0 // 1h
}

fn default_bind_requests_cache_ttl() -> f64 {
    60.0 * 60.0 * 4.0 // 4h
}

fn default_bind_requests_path_re() -> Vec<BindPattern> {
    vec![
        BindPattern {
            path: r"^/api/(oz|wb|ym)/get/item/\d+/".to_string(),
            params: vec!["d1".to_string(), "d2".to_string()],
        },
        BindPattern {
            path: r"^/api/(oz|wb|ym)/get/(ds/)?\w+".to_string(),
            params: vec!["d1".to_string(), "d2".to_string(), "path".to_string()],
        },
    ]
}

fn default_routing_rules() -> RoutingRules {
    RoutingRules {
        allow: Some(vec![
            r"^/api/wb".to_string(),
            r"^/api/oz".to_string(),
            r"^/api/seo".to_string(),
            r"^/api/ym".to_string(),
            "*".to_string(),
        ]),
        deny: Some(vec![]),
    }
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.api.auth_token, "auth");
        assert_eq!(cfg.api.task_queue_maxsize, 25);
        assert_eq!(cfg.donor.freeze_status_codes, vec![429]);
        assert_eq!(cfg.donor.api_cooldown_mode, CooldownMode::Window);
        assert_eq!(cfg.donor.api_cooldown_param.window_pair(), Some((5.0, 30.0)));
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert!(cfg.donor.http_cache_enabled);
    }

    #[test]
    fn default_routing_rules_end_with_catch_all() {
        let rules = RouterConfig::default().donor.api_default_routing_rules;
        assert_eq!(rules.allow.unwrap().last().map(String::as_str), Some("*"));
    }

    #[test]
    fn bind_patterns_cover_item_paths() {
        let patterns = RouterConfig::default().donor.bind_requests_path_re;
        assert!(crate::pattern::matches(
            &patterns[0].path,
            "/api/wb/get/item/90159753/sales"
        ));
        assert_eq!(patterns[0].params, vec!["d1", "d2"]);
    }

    #[test]
    fn config_roundtrips_through_yaml() {
        let cfg = RouterConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: RouterConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.server.port, cfg.server.port);
        assert_eq!(back.donor.banned_status_codes, cfg.donor.banned_status_codes);
    }
}
