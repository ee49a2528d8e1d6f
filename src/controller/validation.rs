//! # Expression Validation
//!
//! LogQL expressions are checked by asking a running Loki to evaluate them.
//! A query that Loki accepts with `200 OK` is considered valid; any other
//! status, or a transport failure, is considered invalid so that a broken
//! expression never reaches the ruler.

use crate::config::LokiEndpoint;
use crate::constants::LOKI_QUERY_ENDPOINT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Capability used by the fragment compiler to check expressions
#[async_trait]
pub trait ExpressionValidator: Send + Sync + Debug {
    /// Returns `true` only when the expression is known to be valid
    async fn validate(&self, expr: &str) -> bool;
}

/// Validator backed by the Loki query API
#[derive(Debug, Clone)]
pub struct LokiQueryValidator {
    client: reqwest::Client,
    base_url: String,
}

impl LokiQueryValidator {
    /// Build a validator sending the endpoint's extra headers on every request
    pub fn new(endpoint: &LokiEndpoint, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("Invalid Loki header name: {key}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for Loki header {key}"))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build Loki HTTP client")?;

        Ok(Self {
            client,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ExpressionValidator for LokiQueryValidator {
    async fn validate(&self, expr: &str) -> bool {
        validate_on_server(&self.client, &self.base_url, expr).await
    }
}

/// Ask the Loki at `base_url` whether `expr` is a valid LogQL query
pub async fn validate_on_server(client: &reqwest::Client, base_url: &str, expr: &str) -> bool {
    let url = format!("{base_url}{LOKI_QUERY_ENDPOINT}");
    let response = match client.get(&url).query(&[("query", expr)]).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to reach Loki at {} to validate expression: {}", url, e);
            return false;
        }
    };

    match response.status() {
        StatusCode::OK => {
            debug!("Loki accepted expression: {}", expr);
            true
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Loki rejected expression with status {}: {} ({})",
                status,
                expr,
                body.trim()
            );
            false
        }
    }
}
