//! Research engine seam

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A cited source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// What a research engine returns for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub report: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Estimated spend in USD
    #[serde(default)]
    pub cost: f64,
}

/// Web-research backend used by researchers
#[async_trait]
pub trait ResearchEngine: Send + Sync {
    async fn research(&self, query: &str, guidance: &str) -> Result<ResearchReport>;
}
