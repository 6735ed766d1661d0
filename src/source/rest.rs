//! HTTP(S) JSON endpoint source.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{redirect, Method};
use tracing::{debug, warn};
use url::Url;

use crate::config::{SourceConfig, SourceKind, DEFAULT_TIMEOUT};
use crate::error::{Result, SourceError};
use crate::security::{validate_http_url, SecurityPolicy};
use crate::source::format::extract_rows;
use crate::source::{expand_env, required, Row, Source};

/// Maximum number of error-body bytes kept in an HTTP error.
const MAX_ERROR_BODY: usize = 1024;

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 10;

/// Fetches rows from a JSON HTTP endpoint.
#[derive(Debug, Clone)]
pub struct RestSource {
    name: String,
    url: Url,
    method: Method,
    headers: HeaderMap,
    result_path: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl RestSource {
    /// Build a REST source.
    ///
    /// The URL, header values and query parameters are `${VAR}`-expanded, then
    /// the URL is checked by the SSRF validator. Redirect targets are checked
    /// the same way before they are followed.
    pub fn new(name: &str, config: &SourceConfig, policy: &SecurityPolicy) -> Result<Self> {
        let raw = expand_env(required(name, "url", &config.url)?, &config.env);
        let mut url = validate_http_url(&raw, policy).map_err(|e| match e {
            crate::security::UrlRejection::Invalid(reason) => SourceError::config(name, reason),
            other => SourceError::security(name, other.to_string()),
        })?;

        if !config.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &config.query_params {
                pairs.append_pair(key, &expand_env(value, &config.env));
            }
        }

        let method = parse_method(config.method.as_deref().unwrap_or("GET"))
            .ok_or_else(|| SourceError::config(name, format!("unsupported HTTP method {:?}", config.method)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SourceError::config(name, format!("invalid header name {key:?}: {e}")))?;
            let value = HeaderValue::from_str(&expand_env(value, &config.env))
                .map_err(|e| SourceError::config(name, format!("invalid header value for {key:?}: {e}")))?;
            headers.insert(header, value);
        }

        let timeout = config.timeout_or(DEFAULT_TIMEOUT);
        let redirect_policy = *policy;
        let client = reqwest::Client::builder()
            .user_agent(concat!("livesource-rs/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    return attempt.error("too many redirects");
                }
                match validate_http_url(attempt.url().as_str(), &redirect_policy) {
                    Ok(_) => attempt.follow(),
                    Err(rejection) => attempt.error(rejection),
                }
            }))
            .build()
            .map_err(|e| SourceError::config(name, format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            url,
            method,
            headers,
            result_path: config.result_path.clone().filter(|p| !p.is_empty()),
            timeout,
            client,
        })
    }

    /// The validated request URL, including query parameters.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Source for RestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Rest
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let started = Instant::now();
        let response = self
            .client
            .request(self.method.clone(), self.url.clone())
            .header(ACCEPT, "application/json")
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    warn!(source = %self.name, "HTTP request timed out");
                    SourceError::Timeout {
                        source_name: self.name.clone(),
                        timeout: self.timeout,
                    }
                } else {
                    SourceError::transient(&self.name, format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::transient(&self.name, format!("failed to read response: {e}")))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(source = %self.name, status = status.as_u16(), elapsed_ms, bytes = body.len(), "HTTP response");

        if !status.is_success() {
            let cut = body.len().min(MAX_ERROR_BODY);
            return Err(SourceError::Http {
                source_name: self.name.clone(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body[..cut]).into_owned(),
            });
        }

        let text = String::from_utf8_lossy(&body);
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let value = serde_json::from_str(text)
            .map_err(|e| SourceError::parse(&self.name, format!("response is not JSON: {e}")))?;
        extract_rows(&self.name, value, self.result_path.as_deref())
    }
}

fn parse_method(method: &str) -> Option<Method> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "PATCH" => Some(Method::PATCH),
        "DELETE" => Some(Method::DELETE),
        "HEAD" => Some(Method::HEAD),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(config: &SourceConfig) -> Result<RestSource> {
        RestSource::new("api", config, &SecurityPolicy::default())
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let config = SourceConfig::builder(SourceKind::Rest).build();
        assert!(build(&config).unwrap_err().is_config());
    }

    #[test]
    fn test_internal_url_is_security_error() {
        let config = SourceConfig::builder(SourceKind::Rest)
            .url("http://169.254.169.254/latest/meta-data")
            .build();
        assert!(build(&config).unwrap_err().is_security());
    }

    #[test]
    fn test_query_params_and_method() {
        let config = SourceConfig::builder(SourceKind::Rest)
            .url("https://93.184.216.34/items?fixed=1")
            .query_param("page", "2")
            .method("post")
            .build();
        let source = build(&config).unwrap();
        assert_eq!(source.url().query(), Some("fixed=1&page=2"));
        assert_eq!(source.method, Method::POST);
    }

    #[test]
    fn test_bad_method_and_header() {
        let config = SourceConfig::builder(SourceKind::Rest)
            .url("https://93.184.216.34/")
            .method("BREW")
            .build();
        assert!(build(&config).unwrap_err().is_config());

        let config = SourceConfig::builder(SourceKind::Rest)
            .url("https://93.184.216.34/")
            .header("bad header", "x")
            .build();
        assert!(build(&config).unwrap_err().is_config());
    }
}
