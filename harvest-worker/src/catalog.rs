//! Client for the external review catalog (the App Store customer-reviews
//! feed). The processor only sees the [`AppCatalog`] trait, so tests and
//! alternative catalogs plug in without touching the crawl logic.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde_json::Value;

use harvest_queue::SortMethod;

use crate::error::JobError;

#[derive(Debug, Clone, PartialEq)]
pub struct AppInfo {
    pub title: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub developer: Option<String>,
    pub category: Option<String>,
}

impl AppInfo {
    /// Placeholder used when the catalog cannot resolve the app; the
    /// crawl still proceeds against the review feed.
    pub fn unknown() -> Self {
        Self {
            title: "Unknown".to_owned(),
            description: None,
            version: None,
            developer: None,
            category: None,
        }
    }
}

/// A review as the catalog returns it, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReview {
    pub id: String,
    pub author_name: Option<String>,
    pub author_url: Option<String>,
    pub score: Option<i16>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub version: Option<String>,
    pub url: Option<String>,
    pub submitted_at: Option<String>,
    pub reply_at: Option<String>,
    pub reply_text: Option<String>,
    pub helpful_votes: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("catalog returned status {0}")]
    Status(u16),
    #[error("catalog request failed: {0}")]
    Request(String),
    #[error("catalog response unparseable: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for CatalogError {
    fn from(error: reqwest::Error) -> Self {
        CatalogError::Request(error.to_string())
    }
}

impl From<CatalogError> for JobError {
    fn from(error: CatalogError) -> Self {
        match error {
            CatalogError::RateLimited { retry_after } => JobError::RateLimited {
                reason: "catalog rate limited".to_owned(),
                retry_after,
            },
            CatalogError::Status(status) if status >= 500 || status == 408 => {
                JobError::Transient(format!("catalog returned status {}", status))
            }
            CatalogError::Status(status) => {
                JobError::Permanent(format!("catalog returned status {}", status))
            }
            CatalogError::Request(e) => JobError::Transient(format!("catalog request failed: {}", e)),
            CatalogError::Parse(e) => {
                JobError::Permanent(format!("catalog response unparseable: {}", e))
            }
        }
    }
}

#[async_trait]
pub trait AppCatalog: Send + Sync {
    async fn app(&self, app_id: &str, country: &str) -> Result<AppInfo, CatalogError>;

    /// One page of reviews, `page` in `1..=10`. An empty vec means the
    /// feed is exhausted for that ordering.
    async fn reviews_page(
        &self,
        app_id: &str,
        country: &str,
        sort: SortMethod,
        page: u8,
    ) -> Result<Vec<RawReview>, CatalogError>;
}

/// Catalog implementation over the iTunes lookup API and the public
/// customer-reviews RSS JSON feed.
pub struct ItunesCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl ItunesCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("harvest-worker/0.1")
            .timeout(timeout)
            .build()
            .expect("failed to construct reqwest client for the catalog");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, CatalogError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(CatalogError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CatalogError::Parse(e.to_string()))
    }
}

#[async_trait]
impl AppCatalog for ItunesCatalog {
    async fn app(&self, app_id: &str, country: &str) -> Result<AppInfo, CatalogError> {
        let url = format!(
            "{}/lookup?id={}&country={}",
            self.base_url,
            app_id,
            country.to_ascii_lowercase()
        );
        let body = self.get_json(&url).await?;

        let result = body["results"]
            .as_array()
            .and_then(|results| results.first())
            .ok_or_else(|| CatalogError::Parse(format!("no catalog entry for app {}", app_id)))?;

        Ok(AppInfo {
            title: label_str(&result["trackName"]).unwrap_or_else(|| "Unknown".to_owned()),
            description: label_str(&result["description"]),
            version: label_str(&result["version"]),
            developer: label_str(&result["artistName"]),
            category: label_str(&result["primaryGenreName"]),
        })
    }

    async fn reviews_page(
        &self,
        app_id: &str,
        country: &str,
        sort: SortMethod,
        page: u8,
    ) -> Result<Vec<RawReview>, CatalogError> {
        let sort_segment = match sort {
            SortMethod::Recent => "mostrecent",
            SortMethod::Helpful => "mosthelpful",
        };
        let url = format!(
            "{}/{}/rss/customerreviews/page={}/id={}/sortby={}/json",
            self.base_url,
            country.to_ascii_lowercase(),
            page,
            app_id,
            sort_segment
        );
        let body = self.get_json(&url).await?;

        Ok(parse_feed_entries(&body))
    }
}

/// The feed nests every scalar under `{"label": ...}`, returns a bare
/// object instead of an array for single-entry pages, and includes the app
/// itself as a rating-less entry on page 1. Parse defensively.
fn parse_feed_entries(body: &Value) -> Vec<RawReview> {
    let entry = &body["feed"]["entry"];
    let entries: Vec<&Value> = match entry {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![entry],
        _ => return Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            // Entries without a rating are app metadata, not reviews.
            let score = label_str(&entry["im:rating"])?.parse::<i16>().ok();
            let id = label_str(&entry["id"])?;
            Some(RawReview {
                id,
                author_name: label_str(&entry["author"]["name"]),
                author_url: label_str(&entry["author"]["uri"]),
                score,
                title: label_str(&entry["title"]),
                text: label_str(&entry["content"]),
                version: label_str(&entry["im:version"]),
                url: entry["link"]["attributes"]["href"]
                    .as_str()
                    .map(str::to_owned),
                submitted_at: label_str(&entry["updated"]),
                reply_at: None,
                reply_text: None,
                helpful_votes: label_str(&entry["im:voteSum"]).and_then(|v| v.parse().ok()),
            })
        })
        .collect()
}

fn label_str(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.get("label").and_then(Value::as_str).map(str::to_owned),
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feed_entries_skip_app_metadata() {
        let body = json!({
            "feed": {
                "entry": [
                    { "im:name": {"label": "Some App"}, "id": {"label": "123"} },
                    {
                        "id": {"label": "r1"},
                        "im:rating": {"label": "5"},
                        "author": {"name": {"label": "alice"}, "uri": {"label": "https://example.com/alice"}},
                        "title": {"label": "Great"},
                        "content": {"label": "Works well"},
                        "im:version": {"label": "2.0"},
                        "updated": {"label": "2025-05-01T10:00:00-07:00"},
                        "im:voteSum": {"label": "3"}
                    }
                ]
            }
        });

        let reviews = parse_feed_entries(&body);
        assert_eq!(reviews.len(), 1);
        let review = &reviews[0];
        assert_eq!(review.id, "r1");
        assert_eq!(review.score, Some(5));
        assert_eq!(review.author_name.as_deref(), Some("alice"));
        assert_eq!(review.helpful_votes, Some(3));
    }

    #[test]
    fn single_entry_pages_come_back_as_objects() {
        let body = json!({
            "feed": {
                "entry": {
                    "id": {"label": "r9"},
                    "im:rating": {"label": "1"},
                    "content": {"label": "broken"}
                }
            }
        });

        let reviews = parse_feed_entries(&body);
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "r9");
        assert_eq!(reviews[0].score, Some(1));
    }

    #[test]
    fn exhausted_feed_yields_empty_page() {
        let body = json!({ "feed": {} });
        assert!(parse_feed_entries(&body).is_empty());
    }

    #[test]
    fn catalog_errors_classify_for_retry() {
        assert!(matches!(
            JobError::from(CatalogError::Status(503)),
            JobError::Transient(_)
        ));
        assert!(matches!(
            JobError::from(CatalogError::Status(404)),
            JobError::Permanent(_)
        ));
        assert!(matches!(
            JobError::from(CatalogError::RateLimited { retry_after: None }),
            JobError::RateLimited { .. }
        ));
    }
}
