//! The LABEL processor: batches reviews into taxonomy-constrained prompts,
//! sanitizes what the model returns and upserts one label per review.
//!
//! One bad batch must not poison the rest of the job: malformed model
//! output and most API failures degrade that batch to fallback labels and
//! the run continues. Only authentication failures and explicit rate
//! limiting stop the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use harvest_queue::{Job, JobKind, JobOutcome, LabelPayload};

use crate::error::JobError;
use crate::llm::{ChatModel, ChatRequest, LlmError, Message};
use crate::repository::{Review, ReviewLabel, ReviewStore, Sentiment};
use crate::runtime::{JobProcessor, ProgressHandle};
use crate::taxonomy;

/// Longest direct quote persisted with a label.
const MAX_QUOTE_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct LabelSettings {
    /// Courtesy pause between model calls.
    pub sleep_between_batches: Duration,
}

impl Default for LabelSettings {
    fn default() -> Self {
        Self {
            sleep_between_batches: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Default)]
pub struct LabelRunSummary {
    pub reviews_processed: usize,
    pub fallback_batches: usize,
    pub average_confidence: f64,
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

pub struct LabelProcessor {
    store: Arc<dyn ReviewStore>,
    model: Arc<dyn ChatModel>,
    settings: LabelSettings,
}

impl LabelProcessor {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        model: Arc<dyn ChatModel>,
        settings: LabelSettings,
    ) -> Self {
        Self {
            store,
            model,
            settings,
        }
    }

    /// Catch-up entry point: label up to `limit` reviews that have no
    /// label yet, newest first. Reuses the targeted path.
    pub async fn process_unlabeled(
        &self,
        limit: i64,
        model: &str,
        batch_size: usize,
    ) -> Result<JobOutcome, JobError> {
        let reviews = self.store.unlabeled_reviews(limit).await?;
        if reviews.is_empty() {
            return Ok(
                JobOutcome::success(json!({ "reviews_processed": 0 }), 0)
                    .with_message("no unlabeled reviews"),
            );
        }

        let (progress_tx, _progress_rx) = tokio::sync::watch::channel(0u8);
        let summary = self
            .label_reviews(
                reviews,
                model,
                batch_size,
                &ProgressHandle::new(progress_tx),
                &CancellationToken::new(),
            )
            .await?;

        Ok(summary_outcome(model, &summary))
    }

    async fn label_reviews(
        &self,
        reviews: Vec<Review>,
        model: &str,
        batch_size: usize,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> Result<LabelRunSummary, JobError> {
        let total_batches = reviews.len().div_ceil(batch_size);
        let mut labels: Vec<ReviewLabel> = Vec::with_capacity(reviews.len());
        let mut fallback_batches = 0usize;

        for (index, batch) in reviews.chunks(batch_size).enumerate() {
            if index > 0 && !self.settings.sleep_between_batches.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    _ = tokio::time::sleep(self.settings.sleep_between_batches) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let request = ChatRequest {
                model: model.to_owned(),
                messages: vec![system_message(), user_message(batch)],
                temperature: 0.1,
                json_response: true,
            };

            let completion =
                harvest_common::metrics::timed("llm_complete", self.model.complete(&request))
                    .await;
            match completion {
                Ok(content) => match parse_label_array(&content) {
                    Some(raw_labels) => {
                        let by_id: HashMap<String, Value> = raw_labels
                            .into_iter()
                            .filter_map(|value| {
                                string_field(&value, &["review_id", "reviewId", "id"])
                                    .map(|id| (id, value))
                            })
                            .collect();

                        for review in batch {
                            let label = match by_id.get(&review.id) {
                                Some(value) => sanitize_label(&review.id, value, model),
                                None => {
                                    warn!(review_id = %review.id, "model response missing review, using fallback label");
                                    fallback_label(&review.id, model)
                                }
                            };
                            labels.push(label);
                        }
                    }
                    None => {
                        warn!(batch = index, "model returned unparseable labels, using fallback for the batch");
                        fallback_batches += 1;
                        labels.extend(batch.iter().map(|r| fallback_label(&r.id, model)));
                    }
                },
                // A bad key or explicit pushback stops the whole job; any
                // other API failure degrades this batch only.
                Err(error @ (LlmError::Unauthorized(_) | LlmError::RateLimited(_))) => {
                    return Err(error.into());
                }
                Err(error) => {
                    warn!(batch = index, %error, "model call failed, using fallback for the batch");
                    fallback_batches += 1;
                    labels.extend(batch.iter().map(|r| fallback_label(&r.id, model)));
                }
            }

            metrics::counter!("label_batches_total").increment(1);
            progress.report((20 + 60 * (index + 1) / total_batches) as u8);
        }

        progress.report(80);
        self.store.upsert_labels(&labels).await?;
        progress.report(95);

        let mut summary = LabelRunSummary {
            reviews_processed: labels.len(),
            fallback_batches,
            ..LabelRunSummary::default()
        };
        if !labels.is_empty() {
            summary.average_confidence =
                labels.iter().map(|l| l.confidence).sum::<f64>() / labels.len() as f64;
        }
        for label in &labels {
            match label.sentiment {
                Sentiment::Positive => summary.positive += 1,
                Sentiment::Neutral => summary.neutral += 1,
                Sentiment::Negative => summary.negative += 1,
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl JobProcessor for LabelProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Label
    }

    async fn process(
        &self,
        job: &Job,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let payload = LabelPayload::from_value(&job.payload.0)?;
        progress.report(10);

        let reviews = self.store.reviews_by_ids(&payload.review_ids).await?;
        if reviews.is_empty() {
            return Err(JobError::Permanent("no reviews found".to_owned()));
        }
        progress.report(20);

        let summary = self
            .label_reviews(
                reviews,
                &payload.model,
                payload.batch_size,
                &progress,
                &cancel,
            )
            .await?;

        progress.report(100);
        Ok(summary_outcome(&payload.model, &summary))
    }
}

fn summary_outcome(model: &str, summary: &LabelRunSummary) -> JobOutcome {
    let data = json!({
        "reviews_processed": summary.reviews_processed,
        "model": model,
        "average_confidence": summary.average_confidence,
        "sentiment_breakdown": {
            "positive": summary.positive,
            "neutral": summary.neutral,
            "negative": summary.negative,
        },
    });
    let mut outcome = JobOutcome::success(data, summary.reviews_processed as u64);
    if summary.fallback_batches > 0 {
        outcome = outcome.with_message(format!(
            "partial success: {} batch(es) fell back to default labels",
            summary.fallback_batches
        ));
    }
    outcome
}

fn system_message() -> Message {
    Message::system(format!(
        "You are a meticulous product analyst extracting structured labels from app reviews. \
         Analyze each review based ONLY on the following theme taxonomy:\n{}\n\
         Respond with a single JSON object of the form {{\"labels\": [...]}} containing exactly \
         one entry per input review, each with the fields: review_id, theme, sentiment, severity, \
         feature_request, direct_quote, confidence. Rules: theme MUST be one of the taxonomy \
         names, or \"{}\" if none fits. sentiment MUST be one of positive, neutral or negative. \
         severity MUST be an integer from 1 (minor annoyance) to 5 (critical, app unusable); use \
         1 for positive or neutral sentiment. feature_request MUST be a boolean, true only when \
         the user explicitly asks for a feature. direct_quote MUST be an exact quote from the \
         review of at most {} characters, or an empty string. confidence MUST be a number \
         between 0 and 1. Return ONLY the JSON object, with no commentary.",
        taxonomy::taxonomy_json(),
        taxonomy::FALLBACK_THEME,
        MAX_QUOTE_CHARS,
    ))
}

fn user_message(batch: &[Review]) -> Message {
    let mut body = String::from("Label the following reviews:\n");
    for (index, review) in batch.iter().enumerate() {
        body.push_str(&format!(
            "{}. [review_id: {}] {}\n",
            index + 1,
            review.id,
            review.text
        ));
    }
    Message::user(body)
}

/// Accept either a bare JSON array or an object wrapping one (the forced
/// json_object response format produces the latter).
fn parse_label_array(content: &str) -> Option<Vec<Value>> {
    let value: Value = serde_json::from_str(content.trim()).ok()?;
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.into_iter().find_map(|(_, v)| match v {
            Value::Array(items) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        let field = &value[*name];
        match field {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}

/// Force one model-produced label into the invariants the store demands.
/// Sanitizing an already-sanitized label changes nothing.
pub fn sanitize_label(review_id: &str, value: &Value, model_version: &str) -> ReviewLabel {
    let theme = match value["theme"].as_str() {
        Some(name) if taxonomy::is_known_theme(name) => name.to_owned(),
        _ => taxonomy::FALLBACK_THEME.to_owned(),
    };

    let sentiment = value["sentiment"]
        .as_str()
        .map(Sentiment::parse_or_neutral)
        .unwrap_or(Sentiment::Neutral);

    let severity = match &value["severity"] {
        Value::Number(n) => n.as_i64().unwrap_or(1),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(1),
        _ => 1,
    }
    .clamp(1, 5) as i16;

    let feature_request = match &value["feature_request"] {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "true"),
        _ => false,
    };

    let direct_quote = value["direct_quote"]
        .as_str()
        .map(|quote| truncate_chars(quote, MAX_QUOTE_CHARS))
        .unwrap_or_default();

    let confidence = value["confidence"].as_f64().unwrap_or(0.0);
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    ReviewLabel {
        review_id: review_id.to_owned(),
        theme,
        sentiment,
        severity,
        feature_request,
        direct_quote,
        confidence,
        model_version: model_version.to_owned(),
    }
}

fn fallback_label(review_id: &str, model_version: &str) -> ReviewLabel {
    ReviewLabel {
        review_id: review_id.to_owned(),
        theme: taxonomy::FALLBACK_THEME.to_owned(),
        sentiment: Sentiment::Neutral,
        severity: 1,
        feature_request: false,
        direct_quote: String::new(),
        confidence: 0.0,
        model_version: model_version.to_owned(),
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use chrono::Utc;
    use sqlx::types::Json;
    use uuid::Uuid;

    use crate::repository::testing::MemoryStore;

    #[derive(Default)]
    struct MockChatModel {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockChatModel {
        fn respond_with(&self, response: Result<String, LlmError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for MockChatModel {
        async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(r#"{"labels": []}"#.to_owned()))
        }
    }

    fn review(id: &str, text: &str) -> Review {
        Review {
            id: id.to_owned(),
            app_id: "737534985".to_owned(),
            user_name: "alice".to_owned(),
            user_url: None,
            version: None,
            score: 4,
            title: None,
            text: text.to_owned(),
            url: None,
            date: None,
            reply_date: None,
            reply_text: None,
            helpful_votes: 0,
            country: "US".to_owned(),
        }
    }

    fn label_job(review_ids: &[&str]) -> Job {
        let payload = json!({ "review_ids": review_ids, "batch_size": 20 });
        Job {
            id: Uuid::new_v4(),
            kind: JobKind::Label,
            state: harvest_queue::JobState::Running,
            priority: 5,
            attempt: 1,
            max_attempts: 2,
            payload: Json(payload),
            result: None,
            errors: Json(json!([])),
            progress: 0,
            correlation_id: Uuid::new_v4(),
            lock_id: Some(Uuid::new_v4()),
            locked_by: Some("test".to_owned()),
            attempted_by: vec!["test".to_owned()],
            janitor_touch_count: 0,
            last_heartbeat: None,
            scheduled: Utc::now(),
            created: Utc::now(),
            last_transition: Utc::now(),
            transition_count: 1,
            finished_at: None,
        }
    }

    fn processor(store: Arc<MemoryStore>, model: Arc<MockChatModel>) -> LabelProcessor {
        LabelProcessor::new(
            store,
            model,
            LabelSettings {
                sleep_between_batches: Duration::ZERO,
            },
        )
    }

    async fn run_targeted(
        processor: &LabelProcessor,
        review_ids: &[&str],
    ) -> Result<JobOutcome, JobError> {
        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        processor
            .process(
                &label_job(review_ids),
                ProgressHandle::new(tx),
                CancellationToken::new(),
            )
            .await
    }

    fn label_value(label: &ReviewLabel) -> Value {
        json!({
            "review_id": label.review_id,
            "theme": label.theme,
            "sentiment": label.sentiment.as_str(),
            "severity": label.severity,
            "feature_request": label.feature_request,
            "direct_quote": label.direct_quote,
            "confidence": label.confidence,
        })
    }

    #[tokio::test]
    async fn labels_reviews_from_model_output() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r1", "Crashes on startup"));
        store.push_review(review("r2", "Love the new design"));
        let model = Arc::new(MockChatModel::default());
        model.respond_with(Ok(json!({
            "labels": [
                {"review_id": "r1", "theme": "Performance & Stability", "sentiment": "negative",
                 "severity": 4, "feature_request": false, "direct_quote": "Crashes on startup",
                 "confidence": 0.93},
                {"review_id": "r2", "theme": "User Interface", "sentiment": "positive",
                 "severity": 1, "feature_request": false, "direct_quote": "Love the new design",
                 "confidence": 0.88},
            ]
        })
        .to_string()));

        let outcome = run_targeted(&processor(store.clone(), model), &["r1", "r2"])
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.items_processed, 2);
        assert_eq!(outcome.data["sentiment_breakdown"]["negative"], 1);
        assert_eq!(outcome.data["sentiment_breakdown"]["positive"], 1);
        let average = outcome.data["average_confidence"].as_f64().unwrap();
        assert!((average - 0.905).abs() < 1e-9);

        let labels = store.labels.lock().unwrap();
        assert_eq!(labels["r1"].theme, "Performance & Stability");
        assert_eq!(labels["r1"].severity, 4);
        assert_eq!(labels["r2"].sentiment, Sentiment::Positive);
    }

    #[tokio::test]
    async fn malformed_model_output_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r1", "meh"));
        store.push_review(review("r2", "ok"));
        let model = Arc::new(MockChatModel::default());
        model.respond_with(Ok("this is not json at all".to_owned()));

        let outcome = run_targeted(&processor(store.clone(), model), &["r1", "r2"])
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.data["average_confidence"], 0.0);
        assert!(outcome.message.as_deref().unwrap().contains("fell back"));

        let labels = store.labels.lock().unwrap();
        for id in ["r1", "r2"] {
            assert_eq!(labels[id].theme, taxonomy::FALLBACK_THEME);
            assert_eq!(labels[id].sentiment, Sentiment::Neutral);
            assert_eq!(labels[id].severity, 1);
            assert_eq!(labels[id].confidence, 0.0);
        }
    }

    #[tokio::test]
    async fn reviews_missing_from_the_response_get_fallback_labels() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r1", "good"));
        store.push_review(review("r2", "bad"));
        let model = Arc::new(MockChatModel::default());
        model.respond_with(Ok(json!({
            "labels": [
                {"review_id": "r1", "theme": "Content Quality", "sentiment": "positive",
                 "severity": 1, "feature_request": false, "direct_quote": "good", "confidence": 0.7},
            ]
        })
        .to_string()));

        run_targeted(&processor(store.clone(), model), &["r1", "r2"])
            .await
            .unwrap();

        let labels = store.labels.lock().unwrap();
        assert_eq!(labels["r1"].theme, "Content Quality");
        assert_eq!(labels["r2"].theme, taxonomy::FALLBACK_THEME);
        assert_eq!(labels["r2"].confidence, 0.0);
    }

    #[tokio::test]
    async fn no_resolved_reviews_is_a_permanent_failure() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(MockChatModel::default());

        let result = run_targeted(&processor(store, model), &["ghost"]).await;
        assert!(matches!(result, Err(JobError::Permanent(message)) if message.contains("no reviews found")));
    }

    #[tokio::test]
    async fn unauthorized_model_stops_the_job() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r1", "text"));
        let model = Arc::new(MockChatModel::default());
        model.respond_with(Err(LlmError::Unauthorized("bad key".to_owned())));

        let result = run_targeted(&processor(store.clone(), model), &["r1"]).await;
        assert!(matches!(result, Err(JobError::Permanent(_))));
        assert!(store.labels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limiting_propagates_for_retry() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r1", "text"));
        let model = Arc::new(MockChatModel::default());
        model.respond_with(Err(LlmError::RateLimited("slow down".to_owned())));

        let result = run_targeted(&processor(store, model), &["r1"]).await;
        assert!(matches!(result, Err(JobError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn server_errors_degrade_the_batch_only() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r1", "text"));
        let model = Arc::new(MockChatModel::default());
        model.respond_with(Err(LlmError::Api {
            code: 500,
            message: "upstream sad".to_owned(),
        }));

        let outcome = run_targeted(&processor(store.clone(), model), &["r1"])
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(store.labels.lock().unwrap()["r1"].theme, taxonomy::FALLBACK_THEME);
    }

    #[tokio::test]
    async fn batches_are_sequential_and_sized() {
        let store = Arc::new(MemoryStore::default());
        for i in 0..5 {
            store.push_review(review(&format!("r{}", i), "text"));
        }
        let model = Arc::new(MockChatModel::default());

        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        let processor = LabelProcessor::new(
            store,
            model.clone(),
            LabelSettings {
                sleep_between_batches: Duration::ZERO,
            },
        );
        let payload = json!({ "review_ids": ["r0", "r1", "r2", "r3", "r4"], "batch_size": 2 });
        let mut job = label_job(&[]);
        job.payload = Json(payload);
        processor
            .process(&job, ProgressHandle::new(tx), CancellationToken::new())
            .await
            .unwrap();

        // 5 reviews at batch size 2: three sequential calls.
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn prompt_embeds_taxonomy_and_review_ids() {
        let store = Arc::new(MemoryStore::default());
        store.push_review(review("r42", "needs a widget"));
        let model = Arc::new(MockChatModel::default());

        run_targeted(&processor(store, model.clone()), &["r42"])
            .await
            .unwrap();

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.json_response);
        assert!(request.temperature <= 0.1);
        assert_eq!(request.messages[0].role, "system");
        assert!(request.messages[0].content.contains("General Feedback"));
        assert!(request.messages[0].content.contains("Performance & Stability"));
        assert!(request.messages[1].content.contains("r42"));
        assert!(request.messages[1].content.contains("needs a widget"));
    }

    #[test]
    fn sanitization_clamps_everything() {
        let value = json!({
            "review_id": "r1",
            "theme": "Astrology",
            "sentiment": "furious",
            "severity": 9,
            "feature_request": "Y",
            "direct_quote": "x".repeat(200),
            "confidence": 1.5,
        });
        let label = sanitize_label("r1", &value, "gpt-4.1-mini");

        assert_eq!(label.theme, taxonomy::FALLBACK_THEME);
        assert_eq!(label.sentiment, Sentiment::Neutral);
        assert_eq!(label.severity, 5);
        assert!(label.feature_request);
        assert_eq!(label.direct_quote.chars().count(), 100);
        assert_eq!(label.confidence, 1.0);

        let low = json!({ "review_id": "r1", "severity": 0, "confidence": -3.0 });
        let label = sanitize_label("r1", &low, "gpt-4.1-mini");
        assert_eq!(label.severity, 1);
        assert_eq!(label.confidence, 0.0);
    }

    #[test]
    fn sanitization_is_a_fixed_point() {
        let value = json!({
            "review_id": "r1",
            "theme": "User Interface",
            "sentiment": "positive",
            "severity": 2,
            "feature_request": true,
            "direct_quote": "nice",
            "confidence": 0.8,
        });
        let once = sanitize_label("r1", &value, "gpt-4.1-mini");
        let twice = sanitize_label("r1", &label_value(&once), "gpt-4.1-mini");
        assert_eq!(once, twice);
    }

    #[test]
    fn bare_arrays_and_wrapped_objects_both_parse() {
        assert!(parse_label_array(r#"[{"review_id": "r1"}]"#).is_some());
        assert!(parse_label_array(r#"{"labels": [{"review_id": "r1"}]}"#).is_some());
        assert!(parse_label_array(r#"{"results": [{"review_id": "r1"}]}"#).is_some());
        assert!(parse_label_array(r#"{"count": 3}"#).is_none());
        assert!(parse_label_array("not json").is_none());
    }
}
