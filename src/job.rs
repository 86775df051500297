//! Job payload representation and JSON round-trip.
//!
//! A [`Job`] is the in-memory form of one queued unit of work. Producers
//! write these as JSON onto Redis lists; this module decodes them, exposes
//! the retry/backtrace policies, and re-encodes them for the `retry` and
//! `dead` sorted sets.
//!
//! Fields not recognized by this server are preserved verbatim across a
//! decode/encode cycle, so payloads written by newer producers survive
//! retry bookkeeping untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum retry attempts when a producer enqueues with `retry: true`.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Frames kept when a producer enqueues with `backtrace: true`.
pub const DEFAULT_BACKTRACE_FRAMES: usize = 1000;

/// Queue used when a payload does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Error returned when a queue payload cannot be decoded into a [`Job`].
#[derive(Debug, Error)]
#[error("malformed job payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Retry policy carried on the wire.
///
/// Producers may write either a boolean (`true` means the default maximum
/// of 25 attempts, `false` disables retries) or an explicit attempt count.
/// Both forms round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    /// `retry: true` / `retry: false`.
    Flag(bool),
    /// `retry: <n>` with an explicit maximum.
    Limit(u32),
}

/// Backtrace capture policy carried on the wire.
///
/// Mirrors [`RetryPolicy`]: `true` keeps up to 1000 frames, `false` keeps
/// none, an integer keeps exactly that many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BacktracePolicy {
    /// `backtrace: true` / `backtrace: false`.
    Flag(bool),
    /// `backtrace: <n>` frames.
    Limit(usize),
}

/// One queued unit of work.
///
/// `retry_count` is absent until the first failure; `failed_at` is written
/// exactly once at that transition, while `retried_at` is refreshed on
/// every subsequent failure. The `extra` map carries any fields this server
/// does not recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque identifier, unique per enqueue.
    pub jid: String,
    /// Handler name; resolved through the handler registry at dispatch.
    #[serde(rename = "class")]
    pub klass: String,
    /// Ordered handler arguments as raw JSON values.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Queue the producer targeted; absent means `"default"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Retry policy; absent means no retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Backtrace capture policy; absent means keep no frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<BacktracePolicy>,
    /// Failures seen so far; absent means the job has never failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Epoch seconds of the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,
    /// Epoch seconds of the most recent retry attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,
    /// Message of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Class name of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    /// Captured frames of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<Vec<String>>,
    /// When explicitly `false`, the job must never enter the dead set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,
    /// Fields written by the producer that this server does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Job {
    /// Decodes a queue payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the payload is not valid JSON or lacks
    /// the required `jid`/`class` fields.
    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encodes the job back into its wire form.
    ///
    /// Recognized fields keep their decoded values and unknown fields are
    /// re-emitted, so an untouched job re-encodes to an equivalent payload.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Queue this job belongs to, falling back to `"default"`.
    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    /// Maximum failures before the job is exhausted.
    ///
    /// `retry: true` maps to 25, `retry: false` and an absent field map to
    /// zero, an integer is taken as-is.
    pub fn max_retries(&self) -> u32 {
        match self.retry {
            Some(RetryPolicy::Flag(true)) => DEFAULT_MAX_RETRIES,
            Some(RetryPolicy::Flag(false)) | None => 0,
            Some(RetryPolicy::Limit(n)) => n,
        }
    }

    /// Number of backtrace frames to keep on failure.
    pub fn backtrace_limit(&self) -> usize {
        match self.backtrace {
            Some(BacktracePolicy::Flag(true)) => DEFAULT_BACKTRACE_FRAMES,
            Some(BacktracePolicy::Flag(false)) | None => 0,
            Some(BacktracePolicy::Limit(n)) => n,
        }
    }

    /// Whether the producer opted this job out of the dead set.
    pub fn death_suppressed(&self) -> bool {
        self.dead == Some(false)
    }
}
