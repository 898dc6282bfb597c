//! The SCRAPE processor: crawls the `countries x sort_methods x pages`
//! matrix for one app, deduplicates observations and persists them.
//!
//! Fault policy: only failures before the crawl matrix (app resolution is
//! tolerated, the app upsert is not) fail the whole job. Inside the matrix
//! every `(sort, country)` cell degrades independently, so a regional
//! outage cannot invalidate reviews collected elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use harvest_queue::{Job, JobKind, JobOutcome, ScrapePayload, SortMethod};

use crate::catalog::{AppCatalog, AppInfo, RawReview};
use crate::error::JobError;
use crate::repository::{AppRecord, Review, ReviewStore};
use crate::runtime::{JobProcessor, ProgressHandle};

pub struct ScrapeProcessor {
    store: Arc<dyn ReviewStore>,
    catalog: Arc<dyn AppCatalog>,
}

impl ScrapeProcessor {
    pub fn new(store: Arc<dyn ReviewStore>, catalog: Arc<dyn AppCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Crawl one `(sort, country)` cell into the accumulator. Within the
    /// job, later observations of the same review overwrite earlier ones.
    async fn crawl_cell(
        &self,
        payload: &ScrapePayload,
        sort: SortMethod,
        country: &str,
        acc: &mut HashMap<String, Review>,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        for page in 1..=payload.pages.min(10) {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            if page > 1 && payload.throttle_ms > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(payload.throttle_ms)) => {}
                }
            }

            let raw_reviews = harvest_common::metrics::timed(
                "catalog_reviews_page",
                self.catalog.reviews_page(&payload.app_id, country, sort, page),
            )
            .await
            .map_err(JobError::from)?;

            if raw_reviews.is_empty() {
                // End of stream for this ordering; later pages would be
                // empty too.
                break;
            }

            for raw in raw_reviews {
                if let Some(review) = normalize_review(raw, &payload.app_id, country) {
                    acc.insert(review.id.clone(), review);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for ScrapeProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Scrape
    }

    async fn process(
        &self,
        job: &Job,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let payload = ScrapePayload::from_value(&job.payload.0)?;

        // App resolution failure is tolerated; the crawl still runs.
        let app_info = match self
            .catalog
            .app(&payload.app_id, &payload.countries[0])
            .await
        {
            Ok(info) => info,
            Err(error) => {
                warn!(app_id = %payload.app_id, %error, "failed to resolve app info");
                AppInfo::unknown()
            }
        };
        progress.report(10);

        self.store
            .upsert_app(&AppRecord {
                id: payload.app_id.clone(),
                title: app_info.title.clone(),
                description: app_info.description.clone(),
                version: app_info.version.clone(),
                developer: app_info.developer.clone(),
                category: app_info.category.clone(),
            })
            .await?;
        progress.report(20);

        let mut acc: HashMap<String, Review> = HashMap::new();
        progress.report(30);

        let total_cells = payload.sort_methods.len() * payload.countries.len();
        let mut cells_done = 0usize;
        let mut failed_cells = 0usize;

        for sort in &payload.sort_methods {
            for country in &payload.countries {
                match self
                    .crawl_cell(&payload, *sort, country, &mut acc, &cancel)
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("scrape_cells_total", &[("outcome", "ok")]).increment(1);
                    }
                    Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                    Err(error) => {
                        warn!(
                            app_id = %payload.app_id,
                            country = %country,
                            sort = %sort,
                            %error,
                            "crawl cell failed, continuing with the rest of the matrix"
                        );
                        failed_cells += 1;
                        metrics::counter!("scrape_cells_total", &[("outcome", "failed")])
                            .increment(1);
                    }
                }
                cells_done += 1;
                progress.report(30 + (60 * cells_done / total_cells) as u8);
            }
        }

        let reviews: Vec<Review> = acc.into_values().collect();
        let persisted = self.store.upsert_reviews(&reviews).await?;
        progress.report(95);

        let data = json!({
            "reviews_scraped": reviews.len(),
            "countries_processed": payload.countries,
            "sort_methods_used": payload.sort_methods,
            "app_title": app_info.title,
        });
        progress.report(100);

        let mut outcome = JobOutcome::success(data, reviews.len() as u64);
        if failed_cells > 0 || persisted.failed > 0 {
            outcome = outcome.with_message(format!(
                "partial success: {} of {} crawl cells failed, {} rows skipped",
                failed_cells, total_cells, persisted.failed
            ));
        }
        Ok(outcome)
    }
}

/// Canonicalize one raw catalog review. Reviews without an id or a star
/// rating carry nothing we can persist and are dropped.
fn normalize_review(raw: RawReview, app_id: &str, country: &str) -> Option<Review> {
    if raw.id.trim().is_empty() {
        return None;
    }
    let score = raw.score?.clamp(1, 5);

    Some(Review {
        id: raw.id,
        app_id: app_id.to_owned(),
        user_name: raw
            .author_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Anonymous".to_owned()),
        user_url: raw.author_url,
        version: raw.version,
        score,
        title: raw.title,
        text: raw.text.unwrap_or_default(),
        url: raw.url,
        date: raw.submitted_at.as_deref().and_then(parse_instant),
        reply_date: raw.reply_at.as_deref().and_then(parse_instant),
        reply_text: raw.reply_text,
        helpful_votes: raw.helpful_votes.unwrap_or(0).clamp(0, i32::MAX as i64) as i32,
        country: country.to_ascii_uppercase(),
    })
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
