//! Cursor pager: paginated pulls against feed resources.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::{chat_message_from_json, notification_from_json, status_from_json};
use crate::feed_id::Resource;
use crate::{Cursor, FeedId, FeedKind, ItemRef, PullError, PullPage};

/// Parameters of one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequest {
    /// Follow this cursor verbatim instead of building a request.
    pub cursor: Option<Cursor>,
    pub max_id: Option<String>,
    pub since_id: Option<String>,
    pub limit: Option<u32>,
}

impl PullRequest {
    pub fn newest(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn from_cursor(cursor: Cursor) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::default()
        }
    }
}

/// Performs paginated pulls for a feed.
#[async_trait]
pub trait CursorPager: Send + Sync {
    async fn pull(&self, feed: &FeedId, request: &PullRequest) -> Result<PullPage, PullError>;
}

/// Parse an RFC 8288 `Link` header into `(next, prev)` cursors.
pub fn parse_link_header(header: &str) -> (Option<Cursor>, Option<Cursor>) {
    let mut next = None;
    let mut prev = None;

    for part in header.split(',') {
        let mut segments = part.split(';');
        let Some(target) = segments.next() else {
            continue;
        };
        let target = target.trim();
        let Some(url) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) else {
            continue;
        };

        for param in segments {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.trim() != "rel" {
                continue;
            }
            for rel in value.trim().trim_matches('"').split_whitespace() {
                match rel {
                    "next" => next = Some(Cursor::new(url)),
                    "prev" | "previous" => prev = Some(Cursor::new(url)),
                    _ => {}
                }
            }
        }
    }

    (next, prev)
}

/// Normalize a page of raw entities for the given feed kind.
///
/// Entities that fail to normalize are skipped.
pub fn normalize_page(kind: FeedKind, values: &[Value]) -> Vec<ItemRef> {
    values
        .iter()
        .filter_map(|value| {
            let result = match kind {
                FeedKind::Timeline => status_from_json(value),
                FeedKind::Notifications => notification_from_json(value),
                FeedKind::Chat => chat_message_from_json(value).map(|(_, item)| item),
            };
            match result {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(error = %e, "skipping entity that failed to normalize");
                    None
                }
            }
        })
        .collect()
}

/// [`CursorPager`] over the server's REST API.
pub struct HttpPager {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpPager {
    /// Create a pager for the given server base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, resource: &Resource, request: &PullRequest) -> reqwest::RequestBuilder {
        let builder = match &request.cursor {
            Some(cursor) => self.http.get(cursor.as_str()),
            None => {
                let mut query: Vec<(&str, String)> = resource
                    .query
                    .iter()
                    .map(|(k, v)| (*k, v.clone()))
                    .collect();
                if let Some(max_id) = &request.max_id {
                    query.push(("max_id", max_id.clone()));
                }
                if let Some(since_id) = &request.since_id {
                    query.push(("since_id", since_id.clone()));
                }
                if let Some(limit) = request.limit {
                    query.push(("limit", limit.to_string()));
                }
                self.http
                    .get(format!("{}{}", self.base_url, resource.path))
                    .query(&query)
            }
        };

        match &self.access_token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }
}

#[async_trait]
impl CursorPager for HttpPager {
    async fn pull(&self, feed: &FeedId, request: &PullRequest) -> Result<PullPage, PullError> {
        let resource = feed.resource();
        let response = self.build_request(&resource, request).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(PullError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let (next, prev) = response
            .headers()
            .get("Link")
            .and_then(|v| v.to_str().ok())
            .map(parse_link_header)
            .unwrap_or((None, None));

        let body: Value = response.json().await?;
        let Value::Array(values) = body else {
            return Err(PullError::InvalidResponse(format!(
                "expected an array of entities for {}",
                feed
            )));
        };

        let items = normalize_page(feed.kind(), &values);
        debug!(
            feed = %feed,
            count = items.len(),
            partial,
            has_next = next.is_some(),
            "pulled page"
        );

        Ok(PullPage {
            items,
            next,
            prev,
            partial,
        })
    }
}
