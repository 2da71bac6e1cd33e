//! Rate-limited arXiv API client.
//!
//! Every request goes through the process-wide [`RequestGate`]. A 429 or 503
//! is retried with exponential backoff; any other non-success status, a
//! transport failure, or an unreadable body is returned to the caller, whose
//! retry policy decides what happens next.

use crate::atom::{AtomFeed, parse_feed};
use crate::rate_limit::RequestGate;
use async_trait::async_trait;
use paperloop_core::config::ArxivConfig;
use paperloop_core::error::FetchError;
use paperloop_core::research::PaperSource;
use paperloop_core::types::{PaperRef, SearchRequest, SortBy, SortOrder, validate_max_results};
use std::sync::Arc;
use std::time::Duration;

/// Longest slice of an error body carried into [`FetchError::HttpStatus`].
const ERROR_BODY_PREVIEW: usize = 200;

/// A raw HTTP response: status code and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The wire underneath [`ArxivClient`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue a GET. Only connection-level failures are errors; any HTTP
    /// status comes back as a response.
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

/// [`HttpTransport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ArxivConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Transport {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("arXiv request timed out: {}", e)
            } else {
                format!("arXiv request failed: {}", e)
            };
            FetchError::Transport { message }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| FetchError::Transport {
            message: format!("Failed to read arXiv response: {}", e),
        })?;
        Ok(HttpResponse { status, body })
    }
}

/// Client for the arXiv export API.
pub struct ArxivClient {
    transport: Arc<dyn HttpTransport>,
    gate: Arc<RequestGate>,
    base_url: String,
    max_retries: u32,
    backoff_base: Duration,
}

impl ArxivClient {
    /// Build a client over `reqwest` that shares the process-wide gate.
    pub fn new(config: &ArxivConfig) -> Result<Self, FetchError> {
        let transport = Arc::new(ReqwestTransport::new(config)?);
        let gate = RequestGate::shared(Duration::from_millis(config.min_interval_ms));
        Ok(Self::with_transport(transport, gate, config))
    }

    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        gate: Arc<RequestGate>,
        config: &ArxivConfig,
    ) -> Self {
        Self {
            transport,
            gate,
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Full-text search. The query is sent as `all:<query>`.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<PaperRef>, FetchError> {
        request.validate()?;
        let url = build_search_url(
            &self.base_url,
            &format!("all:{}", request.query.trim()),
            request.max_results,
            request.sort_by,
            request.sort_order,
        );
        tracing::info!(
            query = %request.query.trim(),
            max_results = request.max_results,
            "Searching arXiv"
        );
        let feed = self.fetch_feed(&url).await?;
        tracing::info!(
            returned = feed.papers.len(),
            total = feed.total_results,
            "arXiv search complete"
        );
        Ok(feed.papers)
    }

    /// Search within one category, optionally narrowed by a free-text query.
    pub async fn search_by_category(
        &self,
        category: &str,
        query: Option<&str>,
        max_results: u32,
        sort_by: SortBy,
        sort_order: SortOrder,
    ) -> Result<Vec<PaperRef>, FetchError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(FetchError::invalid("category cannot be empty"));
        }
        validate_max_results(max_results)?;

        let search_query = match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => format!("(cat:{}) AND (all:{})", category, q),
            None => format!("cat:{}", category),
        };
        let url = build_search_url(&self.base_url, &search_query, max_results, sort_by, sort_order);
        tracing::info!(category, "Searching arXiv category");
        Ok(self.fetch_feed(&url).await?.papers)
    }

    /// Fetch one paper. `Ok(None)` when arXiv has no such entry.
    pub async fn get_paper_by_id(&self, id: &str) -> Result<Option<PaperRef>, FetchError> {
        let id = id.trim();
        validate_arxiv_id(id)?;
        let url = format!(
            "{}?id_list={}&max_results=1",
            self.base_url,
            urlencoding::encode(id)
        );
        let feed = self.fetch_feed(&url).await?;
        Ok(feed.papers.into_iter().next())
    }

    async fn fetch_feed(&self, url: &str) -> Result<AtomFeed, FetchError> {
        let body = self.get_with_retry(url).await?;
        parse_feed(&body)
    }

    /// GET through the gate, retrying 429 and 503.
    async fn get_with_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut backoff = Duration::ZERO;
        let mut last_status = 0;

        for attempt in 0..=self.max_retries {
            self.gate.acquire_after(backoff).await;
            tracing::debug!(attempt = attempt + 1, url, "arXiv request");

            let response = self.transport.get(url).await?;
            if response.is_success() {
                return Ok(response.body);
            }

            match response.status {
                429 | 503 => {
                    last_status = response.status;
                    if attempt < self.max_retries {
                        backoff = self.backoff_for(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            status = response.status,
                            backoff_ms = backoff.as_millis() as u64,
                            "arXiv throttled request, backing off"
                        );
                    }
                }
                status => {
                    let body: String = response.body.chars().take(ERROR_BODY_PREVIEW).collect();
                    return Err(FetchError::HttpStatus { status, body });
                }
            }
        }

        tracing::warn!(
            attempts = self.max_retries + 1,
            status = last_status,
            "arXiv unavailable, giving up"
        );
        Err(FetchError::UpstreamUnavailable {
            attempts: self.max_retries + 1,
            status: last_status,
        })
    }

    /// `backoff_base * 2^attempt`, saturating.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base.saturating_mul(factor)
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<PaperRef>, FetchError> {
        ArxivClient::search(self, request).await
    }
}

/// Build an export-API query URL.
pub fn build_search_url(
    base_url: &str,
    search_query: &str,
    max_results: u32,
    sort_by: SortBy,
    sort_order: SortOrder,
) -> String {
    format!(
        "{}?search_query={}&start=0&max_results={}&sortBy={}&sortOrder={}",
        base_url,
        urlencoding::encode(search_query),
        max_results,
        sort_by.as_api_str(),
        sort_order.as_api_str()
    )
}

/// Accept `YYMM.NNNNN[vN]` and `archive[.XX]/NNNNNNN[vN]` identifiers.
pub fn validate_arxiv_id(id: &str) -> Result<(), FetchError> {
    if id.is_empty() {
        return Err(FetchError::invalid("arXiv id cannot be empty"));
    }
    if is_new_style_id(id) || is_old_style_id(id) {
        Ok(())
    } else {
        Err(FetchError::invalid(format!(
            "invalid arXiv id '{}' (expected e.g. 2301.12345 or hep-th/9901001)",
            id
        )))
    }
}

fn strip_version(id: &str) -> Option<&str> {
    match id.rsplit_once('v') {
        Some((base, version)) => {
            (!version.is_empty() && version.chars().all(|c| c.is_ascii_digit())).then_some(base)
        }
        None => Some(id),
    }
}

fn is_new_style_id(id: &str) -> bool {
    let Some(base) = strip_version(id) else {
        return false;
    };
    let Some((yymm, number)) = base.split_once('.') else {
        return false;
    };
    yymm.len() == 4
        && yymm.chars().all(|c| c.is_ascii_digit())
        && (4..=5).contains(&number.len())
        && number.chars().all(|c| c.is_ascii_digit())
}

fn is_old_style_id(id: &str) -> bool {
    let Some((archive, number)) = id.split_once('/') else {
        return false;
    };
    let Some(number) = strip_version(number) else {
        return false;
    };
    let archive_ok = !archive.is_empty()
        && archive
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '-' || c == '.');
    archive_ok && number.len() == 7 && number.chars().all(|c| c.is_ascii_digit())
}
