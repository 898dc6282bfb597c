//! Relational repository for apps, reviews and labels. All writes are
//! idempotent upserts keyed on the natural ids, so re-running a job can
//! never duplicate rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

/// Rows written per statement when persisting a crawl.
const UPSERT_BATCH_SIZE: usize = 50;

#[derive(Debug, thiserror::Error)]
#[error("database error: {0}")]
pub struct StoreError(#[from] sqlx::Error);

#[derive(Debug, Clone, PartialEq)]
pub struct AppRecord {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub developer: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Review {
    pub id: String,
    pub app_id: String,
    pub user_name: String,
    pub user_url: Option<String>,
    pub version: Option<String>,
    pub score: i16,
    pub title: Option<String>,
    pub text: String,
    pub url: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub reply_date: Option<DateTime<Utc>>,
    pub reply_text: Option<String>,
    pub helpful_votes: i32,
    pub country: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    /// Lenient parse used when sanitizing model output; anything
    /// unrecognized collapses to neutral.
    pub fn parse_or_neutral(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "negative" => Sentiment::Negative,
            _ => Sentiment::Neutral,
        }
    }
}

/// A sanitized label ready to persist; at most one exists per review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewLabel {
    pub review_id: String,
    pub theme: String,
    pub sentiment: Sentiment,
    pub severity: i16,
    pub feature_request: bool,
    pub direct_quote: String,
    pub confidence: f64,
    pub model_version: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub upserted: u64,
    pub failed: u64,
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn upsert_app(&self, app: &AppRecord) -> Result<(), StoreError>;

    /// Upsert reviews in batches. Individual row failures are logged and
    /// counted, never propagated: one poisoned review must not discard a
    /// whole crawl.
    async fn upsert_reviews(&self, reviews: &[Review]) -> Result<UpsertOutcome, StoreError>;

    async fn reviews_by_ids(&self, ids: &[String]) -> Result<Vec<Review>, StoreError>;

    /// Up to `limit` reviews that have no label yet, newest first.
    async fn unlabeled_reviews(&self, limit: i64) -> Result<Vec<Review>, StoreError>;

    async fn upsert_labels(&self, labels: &[ReviewLabel]) -> Result<u64, StoreError>;
}

pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_review_row(&self, review: &Review) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
INSERT INTO reviews
    (id, app_id, user_name, user_url, version, score, title, text, url,
     date, reply_date, reply_text, helpful_votes, country)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT (id) DO UPDATE SET
    user_name = EXCLUDED.user_name,
    user_url = EXCLUDED.user_url,
    version = EXCLUDED.version,
    score = EXCLUDED.score,
    title = EXCLUDED.title,
    text = EXCLUDED.text,
    url = EXCLUDED.url,
    date = EXCLUDED.date,
    reply_date = EXCLUDED.reply_date,
    reply_text = EXCLUDED.reply_text,
    helpful_votes = EXCLUDED.helpful_votes,
    country = EXCLUDED.country
            "#,
        )
        .bind(&review.id)
        .bind(&review.app_id)
        .bind(&review.user_name)
        .bind(&review.user_url)
        .bind(&review.version)
        .bind(review.score)
        .bind(&review.title)
        .bind(&review.text)
        .bind(&review.url)
        .bind(review.date)
        .bind(review.reply_date)
        .bind(&review.reply_text)
        .bind(review.helpful_votes)
        .bind(&review.country)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn upsert_app(&self, app: &AppRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO apps (id, title, description, version, developer, category)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (id) DO UPDATE SET
    title = EXCLUDED.title,
    description = EXCLUDED.description,
    version = EXCLUDED.version,
    developer = EXCLUDED.developer,
    category = EXCLUDED.category
            "#,
        )
        .bind(&app.id)
        .bind(&app.title)
        .bind(&app.description)
        .bind(&app.version)
        .bind(&app.developer)
        .bind(&app.category)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_reviews(&self, reviews: &[Review]) -> Result<UpsertOutcome, StoreError> {
        let mut outcome = UpsertOutcome::default();

        for chunk in reviews.chunks(UPSERT_BATCH_SIZE) {
            for review in chunk {
                match self.upsert_review_row(review).await {
                    Ok(()) => outcome.upserted += 1,
                    Err(error) => {
                        warn!(review_id = %review.id, %error, "failed to upsert review, skipping row");
                        outcome.failed += 1;
                    }
                }
            }
        }

        metrics::counter!("reviews_upserted_total").increment(outcome.upserted);
        Ok(outcome)
    }

    async fn reviews_by_ids(&self, ids: &[String]) -> Result<Vec<Review>, StoreError> {
        let reviews = sqlx::query_as::<_, Review>(
            "SELECT id, app_id, user_name, user_url, version, score, title, text, url, date, reply_date, reply_text, helpful_votes, country FROM reviews WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(reviews)
    }

    async fn unlabeled_reviews(&self, limit: i64) -> Result<Vec<Review>, StoreError> {
        let reviews = sqlx::query_as::<_, Review>(
            r#"
SELECT r.id, r.app_id, r.user_name, r.user_url, r.version, r.score, r.title,
       r.text, r.url, r.date, r.reply_date, r.reply_text, r.helpful_votes, r.country
FROM reviews r
LEFT JOIN labels l ON l.review_id = r.id
WHERE l.id IS NULL
ORDER BY r.created_at DESC
LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(reviews)
    }

    async fn upsert_labels(&self, labels: &[ReviewLabel]) -> Result<u64, StoreError> {
        let mut upserted = 0;

        for label in labels {
            let result = sqlx::query(
                r#"
INSERT INTO labels
    (review_id, sentiment, confidence, theme, severity, feature_request, direct_quote, model_version)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (review_id) DO UPDATE SET
    sentiment = EXCLUDED.sentiment,
    confidence = EXCLUDED.confidence,
    theme = EXCLUDED.theme,
    severity = EXCLUDED.severity,
    feature_request = EXCLUDED.feature_request,
    direct_quote = EXCLUDED.direct_quote,
    model_version = EXCLUDED.model_version
                "#,
            )
            .bind(&label.review_id)
            .bind(label.sentiment.as_str())
            .bind(label.confidence)
            .bind(&label.theme)
            .bind(label.severity)
            .bind(label.feature_request)
            .bind(&label.direct_quote)
            .bind(&label.model_version)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => upserted += 1,
                Err(error) => {
                    warn!(review_id = %label.review_id, %error, "failed to upsert label, skipping row");
                }
            }
        }

        metrics::counter!("labels_upserted_total").increment(upserted);
        Ok(upserted)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory store used by the processor unit tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryStore {
        pub apps: Mutex<HashMap<String, AppRecord>>,
        pub reviews: Mutex<Vec<Review>>,
        pub labels: Mutex<HashMap<String, ReviewLabel>>,
        /// Review ids whose upsert fails, to exercise row-level fault
        /// swallowing.
        pub failing_review_ids: Mutex<HashSet<String>>,
        /// When set, upsert_app fails, to exercise whole-job failure.
        pub fail_app_upsert: Mutex<bool>,
    }

    impl MemoryStore {
        pub fn review_ids(&self) -> Vec<String> {
            self.reviews
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.id.clone())
                .collect()
        }

        pub fn review(&self, id: &str) -> Option<Review> {
            self.reviews
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned()
        }

        pub fn push_review(&self, review: Review) {
            self.reviews.lock().unwrap().push(review);
        }
    }

    #[async_trait]
    impl ReviewStore for MemoryStore {
        async fn upsert_app(&self, app: &AppRecord) -> Result<(), StoreError> {
            if *self.fail_app_upsert.lock().unwrap() {
                return Err(StoreError(sqlx::Error::PoolClosed));
            }
            self.apps
                .lock()
                .unwrap()
                .insert(app.id.clone(), app.clone());
            Ok(())
        }

        async fn upsert_reviews(&self, reviews: &[Review]) -> Result<UpsertOutcome, StoreError> {
            let failing = self.failing_review_ids.lock().unwrap();
            let mut stored = self.reviews.lock().unwrap();
            let mut outcome = UpsertOutcome::default();

            for review in reviews {
                if failing.contains(&review.id) {
                    outcome.failed += 1;
                    continue;
                }
                match stored.iter_mut().find(|r| r.id == review.id) {
                    Some(existing) => *existing = review.clone(),
                    None => stored.push(review.clone()),
                }
                outcome.upserted += 1;
            }
            Ok(outcome)
        }

        async fn reviews_by_ids(&self, ids: &[String]) -> Result<Vec<Review>, StoreError> {
            let stored = self.reviews.lock().unwrap();
            Ok(stored
                .iter()
                .filter(|r| ids.contains(&r.id))
                .cloned()
                .collect())
        }

        async fn unlabeled_reviews(&self, limit: i64) -> Result<Vec<Review>, StoreError> {
            let labels = self.labels.lock().unwrap();
            let stored = self.reviews.lock().unwrap();
            Ok(stored
                .iter()
                .rev()
                .filter(|r| !labels.contains_key(&r.id))
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn upsert_labels(&self, labels: &[ReviewLabel]) -> Result<u64, StoreError> {
            let mut stored = self.labels.lock().unwrap();
            for label in labels {
                stored.insert(label.review_id.clone(), label.clone());
            }
            Ok(labels.len() as u64)
        }
    }
}
