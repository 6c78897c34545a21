//! Adaptive prefetch scheduler for feeds of generated images.
//!
//! A single coordinator task owns the job queue, the position-indexed cache
//! and the circuit breaker. A fixed pool of worker tasks drives jobs through
//! the external [`generation::GenerationClient`]. Callers talk to the
//! coordinator through the cloneable [`FeedScheduler`] handle.

use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use uuid::Uuid;

pub mod breaker;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod generation;
pub mod predictor;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use config::SchedulerConfig;
pub use scheduler::{FeedScheduler, SchedulerError};

/// Scheduling tier of a job. Lower variants are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    Preload,
    Cache,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Preload, Priority::Cache];

    pub(crate) fn tier(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::Preload => 1,
            Priority::Cache => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::Preload => "preload",
            Priority::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// Reference to the user's source image that every generation is conditioned on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceImage(Arc<str>);

impl SourceImage {
    pub fn new(uri: impl Into<Arc<str>>) -> Self {
        Self(uri.into())
    }

    pub fn uri(&self) -> &str {
        &self.0
    }
}

/// A request for one feed position, before the queue stamps it into a [`Job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub position: u64,
    pub priority: Priority,
    pub prompt: String,
}

impl JobSpec {
    pub fn new(position: u64, priority: Priority) -> Self {
        Self {
            position,
            priority,
            prompt: generation::prompt_for_position(position),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub prompt: String,
    pub priority: Priority,
    pub position: u64,
    pub source: SourceImage,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic enqueue order, used to find the newest jobs on overflow.
    pub(crate) seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub id: Uuid,
    pub url: String,
    pub prompt: String,
    pub position: u64,
    pub cached: bool,
    /// Synthesized locally because the generation service was unavailable.
    pub fallback: bool,
    pub created_at: DateTime<Utc>,
    /// Monotonic write order, newest wins eviction ties.
    pub(crate) seq: u64,
}

impl GeneratedImage {
    pub(crate) fn from_job(job: &Job, url: String, fallback: bool) -> Self {
        Self {
            id: job.id,
            url,
            prompt: job.prompt.clone(),
            position: job.position,
            cached: false,
            fallback,
            created_at: Utc::now(),
            seq: 0,
        }
    }
}
