//! Web capabilities used by the scrape and search tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// Extracted content of one fetched page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait WebFetcher: Send + Sync {
    /// Fetch a URL and return its visible text.
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ToolError>;
}

#[async_trait]
pub trait WebSearcher: Send + Sync {
    /// Ranked results for a free-text query, at most `limit`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolError>;
}
