use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::errors::{CategorizedError, ConfigError};
use crate::utils::split_escaped_list;

/// What a target returned for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointResponse {
    /// HTTP status, if a response arrived at all.
    pub status: Option<u16>,
    /// Wall time from send until the body was fully drained (or the error).
    pub elapsed: Duration,
    /// Transport failure, if any.
    pub error: Option<CategorizedError>,
}

impl EndpointResponse {
    pub fn status(status: u16, elapsed: Duration) -> Self {
        Self {
            status: Some(status),
            elapsed,
            error: None,
        }
    }

    pub fn transport_error(error: CategorizedError, elapsed: Duration) -> Self {
        Self {
            status: error.status_code,
            elapsed,
            error: Some(error),
        }
    }
}

/// A target under test. Implementations must not block other workers while
/// a request is outstanding.
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// Human-readable description, usually the URL.
    fn describe(&self) -> String;

    async fn send(&self) -> EndpointResponse;
}

/// Configuration for building the shared HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub skip_tls_verify: bool,
    /// DNS override in the form `hostname:ip:port`.
    pub resolve_target_addr: Option<String>,
    /// Comma-separated `Name:Value` pairs; `\,` escapes a literal comma.
    pub custom_headers: Option<String>,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            skip_tls_verify: false,
            resolve_target_addr: None,
            custom_headers: None,
            max_idle_per_host: 256,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(resolve) = config.resolve_target_addr.as_deref().filter(|s| !s.is_empty()) {
        let (host, addr) = parse_dns_override(resolve)?;
        debug!(host = %host, addr = %addr, "Applying DNS override");
        builder = builder.resolve(&host, addr);
    }

    let headers = parse_custom_headers(config.custom_headers.as_deref())?;
    if !headers.is_empty() {
        builder = builder.default_headers(headers);
    }

    if config.skip_tls_verify {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    builder.build().map_err(|e| ConfigError::InvalidSetting {
        field: "http client".to_string(),
        message: e.to_string(),
    })
}

fn parse_dns_override(resolve: &str) -> Result<(String, SocketAddr), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidSetting {
        field: "RESOLVE_TARGET_ADDR".to_string(),
        message,
    };

    let parts: Vec<&str> = resolve.split(':').map(str::trim).collect();
    let [host, ip, port] = parts.as_slice() else {
        return Err(invalid(format!(
            "'{}' is not in the expected format 'hostname:ip:port'",
            resolve
        )));
    };
    if host.is_empty() {
        return Err(invalid("hostname part cannot be empty".to_string()));
    }

    let addr = SocketAddr::from_str(&format!("{}:{}", ip, port))
        .map_err(|e| invalid(format!("invalid ip/port '{}:{}': {}", ip, port, e)))?;
    Ok((host.to_string(), addr))
}

/// Parses `Name:Value` pairs into a header map.
pub fn parse_custom_headers(custom_headers: Option<&str>) -> Result<HeaderMap, ConfigError> {
    let mut parsed = HeaderMap::new();
    let Some(headers_str) = custom_headers.filter(|s| !s.trim().is_empty()) else {
        return Ok(parsed);
    };

    let invalid = |message: String| ConfigError::InvalidSetting {
        field: "CUSTOM_HEADERS".to_string(),
        message,
    };

    for pair in split_escaped_list(headers_str) {
        let pair = pair.trim();
        let Some((name, value)) = pair.split_once(':') else {
            return Err(invalid(format!("'{}' is not 'Name:Value'", pair)));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid(format!("header name cannot be empty in '{}'", pair)));
        }

        let header_name = HeaderName::from_str(name)
            .map_err(|e| invalid(format!("invalid header name '{}': {}", name, e)))?;
        let header_value = HeaderValue::from_str(value.trim())
            .map_err(|e| invalid(format!("invalid value for '{}': {}", name, e)))?;
        parsed.insert(header_name, header_value);
    }

    Ok(parsed)
}

/// HTTP target driven through a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: reqwest::Client,
    method: reqwest::Method,
    url: String,
}

impl HttpEndpoint {
    pub fn new(client: reqwest::Client, method: reqwest::Method, url: impl Into<String>) -> Self {
        Self {
            client,
            method,
            url: url.into(),
        }
    }

    pub fn get(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self::new(client, reqwest::Method::GET, url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    async fn send(&self) -> EndpointResponse {
        let started = Instant::now();
        let result = self
            .client
            .request(self.method.clone(), &self.url)
            .send()
            .await;

        match result {
            Ok(mut response) => {
                let status = response.status().as_u16();
                // Bodies are discarded, but must be read to release the connection.
                loop {
                    match response.chunk().await {
                        Ok(Some(_chunk)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            return EndpointResponse::transport_error(
                                CategorizedError::from_reqwest(&e),
                                started.elapsed(),
                            );
                        }
                    }
                }
                EndpointResponse::status(status, started.elapsed())
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Request failed");
                EndpointResponse::transport_error(CategorizedError::from_reqwest(&e), started.elapsed())
            }
        }
    }
}
