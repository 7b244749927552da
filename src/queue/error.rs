//! Queue rejection errors.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RateQueueError;

/// Why the queue refused or gave up on a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The backlog is at capacity
    #[error("Queue max size of {max} queued requests exceeded")]
    QueueFull { max: usize },

    /// A skip-queue request is blocked by a quota
    #[error("Retry in {retry_in_ms}ms")]
    RetryIn { retry_in_ms: u64 },

    /// A skip-queue request is blocked by the concurrency cap
    #[error("Max concurrent requests of {max} requests exceeded")]
    MaxConcurrent { max: usize },

    /// The request's queue deadline passed before it could be dispatched
    #[error(
        "Request timed out. Could not dispatch request before {}",
        .deadline.to_rfc3339_opts(SecondsFormat::Millis, true)
    )]
    TimedOut { deadline: DateTime<Utc> },

    /// The backlog was flushed
    #[error("Request has been canceled.")]
    Canceled,

    /// The request's endpoint weight is misconfigured
    #[error("{0}")]
    Config(String),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::QueueFull { .. } => "E_QUEUE_SIZE_EXCEEDED",
            QueueError::RetryIn { .. } => "E_RETRY_IN",
            QueueError::MaxConcurrent { .. } => "E_MAX_CONCURRENT_REQUESTS",
            QueueError::TimedOut { .. } => "E_TIMEOUT",
            QueueError::Canceled => "E_CANCELED",
            QueueError::Config(_) => "E_CONFIG",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueError::QueueFull { .. } => "QueueSizeExceededError",
            QueueError::RetryIn { .. } => "QueueRetryInError",
            QueueError::MaxConcurrent { .. } => "QueueMaxConcurrentRequestsError",
            QueueError::TimedOut { .. } => "QueueTimeoutError",
            QueueError::Canceled => "QueueCanceledError",
            QueueError::Config(_) => "QueueConfigError",
        }
    }

    /// Milliseconds until a retry may succeed, for quota-bound rejections.
    pub fn retry_in_ms(&self) -> Option<u64> {
        match self {
            QueueError::RetryIn { retry_in_ms } => Some(*retry_in_ms),
            _ => None,
        }
    }

    /// Whether trying again later can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, QueueError::Config(_))
    }

    /// Structured, serializable form of this error.
    pub fn to_record(&self) -> QueueErrorRecord {
        let (max, deadline) = match self {
            QueueError::QueueFull { max } | QueueError::MaxConcurrent { max } => (Some(*max), None),
            QueueError::TimedOut { deadline } => (None, Some(*deadline)),
            _ => (None, None),
        };
        QueueErrorRecord {
            name: self.name().to_string(),
            message: self.to_string(),
            code: self.code().to_string(),
            retry_in: self.retry_in_ms(),
            max,
            deadline,
        }
    }
}

impl From<RateQueueError> for QueueError {
    fn from(err: RateQueueError) -> Self {
        QueueError::Config(err.to_string())
    }
}

/// Serializable representation of a [`QueueError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueErrorRecord {
    pub name: String,
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TryFrom<QueueErrorRecord> for QueueError {
    type Error = RateQueueError;

    fn try_from(record: QueueErrorRecord) -> Result<Self, Self::Error> {
        let missing = |field: &str| {
            let message = format!("queue error record {} is missing '{}'", record.code, field);
            RateQueueError::Config(message)
        };
        let error = match record.code.as_str() {
            "E_QUEUE_SIZE_EXCEEDED" => QueueError::QueueFull {
                max: record.max.ok_or_else(|| missing("max"))?,
            },
            "E_RETRY_IN" => QueueError::RetryIn {
                retry_in_ms: record.retry_in.ok_or_else(|| missing("retryIn"))?,
            },
            "E_MAX_CONCURRENT_REQUESTS" => {
                QueueError::MaxConcurrent { max: record.max.ok_or_else(|| missing("max"))? }
            }
            "E_TIMEOUT" => QueueError::TimedOut {
                deadline: record.deadline.ok_or_else(|| missing("deadline"))?,
            },
            "E_CANCELED" => QueueError::Canceled,
            "E_CONFIG" => QueueError::Config(record.message),
            other => {
                let message = format!("unknown queue error code: {}", other);
                return Err(RateQueueError::Config(message));
            }
        };
        Ok(error)
    }
}

/// Outcome of an enqueued request that did not produce a value.
#[derive(Debug)]
pub enum RequestError<E> {
    /// The queue rejected, evicted or canceled the request
    Queue(QueueError),
    /// The dispatch function failed; the error is passed through unchanged
    Dispatch(E),
}

impl<E: fmt::Display> fmt::Display for RequestError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Queue(e) => write!(f, "{}", e),
            RequestError::Dispatch(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RequestError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Queue(e) => Some(e),
            RequestError::Dispatch(e) => Some(e),
        }
    }
}

impl<E> From<QueueError> for RequestError<E> {
    fn from(err: QueueError) -> Self {
        RequestError::Queue(err)
    }
}

impl<E> RequestError<E> {
    /// Borrow the queue error, if the queue is why the request failed.
    pub fn as_queue(&self) -> Option<&QueueError> {
        match self {
            RequestError::Queue(e) => Some(e),
            RequestError::Dispatch(_) => None,
        }
    }

    /// Take the dispatch error, if the dispatch function is why the request failed.
    pub fn into_dispatch(self) -> Option<E> {
        match self {
            RequestError::Dispatch(e) => Some(e),
            RequestError::Queue(_) => None,
        }
    }

    pub fn is_queue(&self) -> bool {
        matches!(self, RequestError::Queue(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn all_errors() -> Vec<QueueError> {
        vec![
            QueueError::QueueFull { max: 5 },
            QueueError::RetryIn { retry_in_ms: 1_500 },
            QueueError::MaxConcurrent { max: 2 },
            QueueError::TimedOut { deadline: Utc.timestamp_millis_opt(1_000).unwrap() },
            QueueError::Canceled,
            QueueError::Config("Invalid endpoint config for 'GET /x'".to_string()),
        ]
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            QueueError::QueueFull { max: 5 }.to_string(),
            "Queue max size of 5 queued requests exceeded"
        );
        assert_eq!(QueueError::RetryIn { retry_in_ms: 10 }.to_string(), "Retry in 10ms");
        assert_eq!(
            QueueError::MaxConcurrent { max: 2 }.to_string(),
            "Max concurrent requests of 2 requests exceeded"
        );
        assert_eq!(
            QueueError::TimedOut { deadline: Utc.timestamp_millis_opt(1_000).unwrap() }.to_string(),
            "Request timed out. Could not dispatch request before 1970-01-01T00:00:01.000Z"
        );
        assert_eq!(QueueError::Canceled.to_string(), "Request has been canceled.");
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = QueueError::RetryIn { retry_in_ms: 1_500 }.to_record();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["name"], "QueueRetryInError");
        assert_eq!(json["code"], "E_RETRY_IN");
        assert_eq!(json["message"], "Retry in 1500ms");
        assert_eq!(json["retryIn"], 1_500);

        let canceled = serde_json::to_value(QueueError::Canceled.to_record()).unwrap();
        assert!(canceled.get("retryIn").is_none());
    }

    #[test]
    fn test_every_kind_round_trips() {
        for error in all_errors() {
            let json = serde_json::to_string(&error.to_record()).unwrap();
            let record: QueueErrorRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(QueueError::try_from(record).unwrap(), error);
        }
    }

    #[test]
    fn test_unknown_code_is_rejected() {
        let mut record = QueueError::Canceled.to_record();
        record.code = "E_NOPE".to_string();
        assert!(QueueError::try_from(record).is_err());
    }

    #[test]
    fn test_only_config_errors_are_fatal() {
        for error in all_errors() {
            assert_eq!(error.is_retryable(), !matches!(error, QueueError::Config(_)));
        }
    }

    #[test]
    fn test_request_error_accessors() {
        let queued: RequestError<std::io::Error> = QueueError::Canceled.into();
        assert!(queued.is_queue());
        assert_eq!(queued.as_queue(), Some(&QueueError::Canceled));

        let failed: RequestError<std::io::Error> =
            RequestError::Dispatch(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(failed.to_string(), "boom");
        assert_eq!(failed.into_dispatch().unwrap().to_string(), "boom");
    }
}
