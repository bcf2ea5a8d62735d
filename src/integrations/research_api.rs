//! JSON-over-HTTP research engine client
//!
//! Posts `{"query", "guidance"}` to a report endpoint and expects
//! `{"report", "sources", "cost"}` back. Retries are left to the caller so
//! that dispatch can interleave them with cancellation checks.

use super::research::{ResearchEngine, ResearchReport};
use crate::config::ResearchSettings;
use crate::{GtmError, Result};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub struct HttpResearchEngine {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    query: &'a str,
    guidance: &'a str,
}

impl HttpResearchEngine {
    pub fn new(settings: &ResearchSettings, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key,
        })
    }

    /// Build from settings; the API key is optional for local engines
    pub fn from_settings(settings: &ResearchSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::new(settings, api_key)
    }
}

#[async_trait]
impl ResearchEngine for HttpResearchEngine {
    async fn research(&self, query: &str, guidance: &str) -> Result<ResearchReport> {
        debug!(endpoint = %self.endpoint, query, "Research request");

        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&ReportRequest { query, guidance });
        if let Some(ref key) = self.api_key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(GtmError::RateLimited(30)),
            status if status.is_server_error() => {
                return Err(GtmError::Research(format!("engine returned {}", status)))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(GtmError::Other(format!(
                    "research engine rejected request ({}): {}",
                    status, body
                )));
            }
        }

        let report: ResearchReport = response.json().await?;
        if report.report.trim().is_empty() {
            return Err(GtmError::Research("engine returned an empty report".to_string()));
        }
        Ok(report)
    }
}
