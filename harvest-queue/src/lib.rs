//! # harvest-queue
//!
//! A durable job queue implementation backed by a PostgreSQL table, plus
//! the typed job codec and the dead-letter manager built on top of it.
//!
//! Reservation uses `FOR UPDATE SKIP LOCKED` so any number of worker
//! processes can consume the same logical queue with at-least-once
//! semantics. A reserved job stays invisible while its heartbeat is
//! fresh; the janitor returns lapsed reservations to the waiting set.

mod ops;

mod types;
pub use types::DeadLetter;
pub use types::DlqStats;
pub use types::Job;
pub use types::JobKind;
pub use types::JobOutcome;
pub use types::JobState;
pub use types::NewJob;
pub use types::QueueStats;

mod codec;
pub use codec::CleanupPayload;
pub use codec::CodecError;
pub use codec::ExportFormat;
pub use codec::ExportPayload;
pub use codec::LabelPayload;
pub use codec::ProcessResultsPayload;
pub use codec::ScrapePayload;
pub use codec::SortMethod;
pub use codec::DEFAULT_LABEL_MODEL;

mod error;
pub use error::QueueError;

mod config;
pub use config::PoolConfig;

mod queue;
pub use queue::FailDisposition;
pub use queue::Queue;

mod dlq;
pub use dlq::DeadLetterManager;

mod monitor;
pub use monitor::QueueMonitor;
pub use monitor::QueueSnapshot;
pub use monitor::SnapshotSummary;

mod janitor;
pub use janitor::JanitorOutcome;
pub use janitor::JanitorSettings;
pub use janitor::QueueJanitor;
