use async_trait::async_trait;
use drum_core::config::DonorConfig;
use drum_core::proxy::{Proxy, ProxyStatus};
use drum_core::{RouterError, Task, UpstreamResponse};
use std::time::Duration;
use tracing::debug;

/// The seam between the Worker and the upstream API: one buffered
/// HTTPS request in, `(status, headers, body)` out. Non-2xx responses
/// are returned, not raised; the Worker decides what they mean.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, task: &Task) -> Result<UpstreamResponse, RouterError>;
}

/// Production transport: reqwest with the account's token attached
/// under the configured header, an optional SOCKS/HTTP egress proxy,
/// and a connect-error retry budget.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    token_header: String,
    passthrough_headers: Vec<String>,
    default_headers: Vec<(String, String)>,
    retries: u32,
    proxy: Option<Proxy>,
}

impl UpstreamClient {
    pub fn new(
        api_token: &str,
        proxy: Option<Proxy>,
        config: &DonorConfig,
    ) -> Result<Self, RouterError> {
        if config.api_domain.is_empty() {
            return Err(RouterError::Validation(
                "donor.api_domain is not configured".into(),
            ));
        }

        // bodies pass through verbatim: no transparent decompression
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.network_timeout))
            .danger_accept_invalid_certs(true)
            .no_gzip();
        if let Some(proxy) = &proxy {
            let egress = reqwest::Proxy::all(proxy.url())
                .map_err(|e| RouterError::Validation(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(egress);
        }
        let http = builder
            .build()
            .map_err(|e| RouterError::Upstream(e.to_string()))?;

        Ok(Self {
            http,
            base_url: format!("{}://{}", config.api_scheme, config.api_domain),
            api_token: api_token.to_string(),
            token_header: config.api_token_header_name.clone(),
            passthrough_headers: config
                .api_passthrough_headers
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
            default_headers: config
                .api_default_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            retries: config.network_retries,
            proxy,
        })
    }

    fn set_proxy_status(&self, status: ProxyStatus) {
        if let Some(proxy) = &self.proxy {
            proxy.status.set(status);
        }
    }

    fn build_request(&self, task: &Task) -> Result<reqwest::RequestBuilder, RouterError> {
        let mut url = format!("{}/{}", self.base_url, task.path.trim_start_matches('/'));
        if !task.query.is_empty() {
            url.push('?');
            url.push_str(&task.query);
        }

        let method = reqwest::Method::from_bytes(task.method.as_bytes())
            .map_err(|_| RouterError::Validation(format!("bad method: {}", task.method)))?;
        let mut request = self.http.request(method, &url);

        for (header, value) in &self.default_headers {
            request = request.header(header.as_str(), value.as_str());
        }
        for (header, value) in &task.headers {
            let header = header.to_lowercase();
            if self.passthrough_headers.contains(&header) {
                request = request.header(header.as_str(), value.as_str());
            } else {
                debug!(header, "skip non-passthrough header");
            }
        }
        if !self.api_token.is_empty() {
            request = request.header(self.token_header.as_str(), self.api_token.as_str());
        }
        if !task.body.is_empty() {
            request = request.body(task.body.clone());
        }
        Ok(request)
    }
}

#[async_trait]
impl ApiTransport for UpstreamClient {
    async fn send(&self, task: &Task) -> Result<UpstreamResponse, RouterError> {
        debug!(method = %task.method, path = %task.path, "API request");
        self.set_proxy_status(ProxyStatus::Unknown);

        let mut retries = self.retries;
        let response = loop {
            let request = self.build_request(task)?;
            match request.send().await {
                Ok(response) => break response,
                Err(err) if err.is_connect() && retries > 0 => {
                    retries -= 1;
                    debug!(retries, "retrying API request");
                }
                Err(err) => {
                    self.set_proxy_status(ProxyStatus::Dead);
                    return Err(RouterError::Upstream(format!(
                        "API request failed {} {}: {err}",
                        task.method, task.path
                    )));
                }
            }
        };

        let status = response.status().as_u16();
        let url_path = response.url().path().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str() != "transfer-encoding")
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                self.set_proxy_status(ProxyStatus::Dead);
                return Err(RouterError::Upstream(format!(
                    "API response read failed {}: {err}",
                    task.method
                )));
            }
        };

        debug!(status, bytes = body.len(), "API response");
        self.set_proxy_status(ProxyStatus::Alive);
        Ok(UpstreamResponse {
            status,
            headers,
            body,
            url_path,
        })
    }
}
