use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{JobKind, NewJob};

/// Default chat model used for labeling when a job does not pin one.
pub const DEFAULT_LABEL_MODEL: &str = "gpt-4.1-mini";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

fn invalid(message: impl Into<String>) -> CodecError {
    CodecError::InvalidPayload(message.into())
}

/// Review listing order supported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMethod {
    Recent,
    Helpful,
}

impl SortMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMethod::Recent => "recent",
            SortMethod::Helpful => "helpful",
        }
    }
}

impl std::fmt::Display for SortMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortMethod {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recent" => Ok(SortMethod::Recent),
            "helpful" => Ok(SortMethod::Helpful),
            other => Err(invalid(format!("{} is not a valid sort method", other))),
        }
    }
}

fn default_pages() -> u8 {
    5
}

fn default_sort_methods() -> Vec<SortMethod> {
    vec![SortMethod::Recent]
}

fn default_throttle_ms() -> u64 {
    500
}

fn default_priority() -> u8 {
    5
}

fn default_scrape_attempts() -> u8 {
    3
}

fn default_label_attempts() -> u8 {
    2
}

fn default_batch_size() -> usize {
    20
}

fn default_label_model() -> String {
    DEFAULT_LABEL_MODEL.to_owned()
}

fn default_cleanup_older_than_hours() -> u32 {
    168
}

/// Parameters for one crawl of an app's reviews: the cartesian product of
/// `countries x sort_methods x pages` against the external catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScrapePayload {
    pub app_id: String,
    pub countries: Vec<String>,
    #[serde(default = "default_pages")]
    pub pages: u8,
    #[serde(default = "default_sort_methods")]
    pub sort_methods: Vec<SortMethod>,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_scrape_attempts")]
    pub max_attempts: u8,
    #[serde(default)]
    pub delay_ms: u64,
}

impl ScrapePayload {
    /// Check every constraint and apply the canonical coercions. The only
    /// field this mutates is `countries`, which is uppercased.
    pub fn validate(mut self) -> Result<Self, CodecError> {
        if self.app_id.trim().is_empty() {
            return Err(invalid("app_id must not be empty"));
        }
        if self.countries.is_empty() {
            return Err(invalid("countries must not be empty"));
        }
        for country in &mut self.countries {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(invalid(format!(
                    "{} is not a 2-letter country code",
                    country
                )));
            }
            *country = country.to_ascii_uppercase();
        }
        if !(1..=10).contains(&self.pages) {
            return Err(invalid("pages must be between 1 and 10"));
        }
        if self.sort_methods.is_empty() {
            return Err(invalid("sort_methods must not be empty"));
        }
        if self.throttle_ms > 5000 {
            return Err(invalid("throttle_ms must be at most 5000"));
        }
        validate_job_options(self.priority, self.max_attempts)?;
        Ok(self)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, CodecError> {
        let payload: Self =
            serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;
        payload.validate()
    }

    pub fn into_job(self) -> Result<NewJob, CodecError> {
        let payload = self.validate()?;
        let job = NewJob {
            kind: JobKind::Scrape,
            priority: payload.priority as i16,
            max_attempts: payload.max_attempts as i32,
            delay: Duration::from_millis(payload.delay_ms),
            correlation_id: payload.correlation_id.unwrap_or_else(Uuid::new_v4),
            payload: serde_json::to_value(&payload).map_err(|e| invalid(e.to_string()))?,
            job_id: None,
        };
        Ok(job)
    }
}

/// Parameters for labeling a specific set of reviews.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabelPayload {
    pub review_ids: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_label_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taxonomy_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_label_attempts")]
    pub max_attempts: u8,
}

impl LabelPayload {
    pub fn validate(self) -> Result<Self, CodecError> {
        if self.review_ids.is_empty() {
            return Err(invalid("review_ids must not be empty"));
        }
        if self.review_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(invalid("review_ids must not contain empty ids"));
        }
        if !(1..=100).contains(&self.batch_size) {
            return Err(invalid("batch_size must be between 1 and 100"));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("model must not be empty"));
        }
        validate_job_options(self.priority, self.max_attempts)?;
        Ok(self)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, CodecError> {
        let payload: Self =
            serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;
        payload.validate()
    }

    pub fn into_job(self) -> Result<NewJob, CodecError> {
        let payload = self.validate()?;
        let job = NewJob {
            kind: JobKind::Label,
            priority: payload.priority as i16,
            max_attempts: payload.max_attempts as i32,
            delay: Duration::ZERO,
            correlation_id: payload.correlation_id.unwrap_or_else(Uuid::new_v4),
            payload: serde_json::to_value(&payload).map_err(|e| invalid(e.to_string()))?,
            job_id: None,
        };
        Ok(job)
    }
}

/// Post-labeling aggregation window. The processor is a stub for now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProcessResultsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl ProcessResultsPayload {
    pub fn into_job(self) -> Result<NewJob, CodecError> {
        validate_job_options(self.priority, 3)?;
        let job = NewJob {
            kind: JobKind::ProcessResults,
            priority: self.priority as i16,
            max_attempts: 3,
            delay: Duration::ZERO,
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            payload: serde_json::to_value(&self).map_err(|e| invalid(e.to_string()))?,
            job_id: None,
        };
        Ok(job)
    }
}

/// Retention maintenance request. The processor is a stub for now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CleanupPayload {
    #[serde(default = "default_cleanup_older_than_hours")]
    pub older_than_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl CleanupPayload {
    pub fn into_job(self) -> Result<NewJob, CodecError> {
        if self.older_than_hours == 0 {
            return Err(invalid("older_than_hours must be positive"));
        }
        let job = NewJob {
            kind: JobKind::Cleanup,
            priority: default_priority() as i16,
            max_attempts: 3,
            delay: Duration::ZERO,
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            payload: serde_json::to_value(&self).map_err(|e| invalid(e.to_string()))?,
            job_id: None,
        };
        Ok(job)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat::Csv
    }
}

/// Bulk export request. The processor is a stub for now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExportPayload {
    pub app_id: String,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl ExportPayload {
    pub fn into_job(self) -> Result<NewJob, CodecError> {
        if self.app_id.trim().is_empty() {
            return Err(invalid("app_id must not be empty"));
        }
        let job = NewJob {
            kind: JobKind::Export,
            priority: default_priority() as i16,
            max_attempts: 3,
            delay: Duration::ZERO,
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            payload: serde_json::to_value(&self).map_err(|e| invalid(e.to_string()))?,
            job_id: None,
        };
        Ok(job)
    }
}

fn validate_job_options(priority: u8, max_attempts: u8) -> Result<(), CodecError> {
    if !(1..=10).contains(&priority) {
        return Err(invalid("priority must be between 1 and 10"));
    }
    if max_attempts > 5 {
        return Err(invalid("max_attempts must be at most 5"));
    }
    Ok(())
}
