//! Response descriptor and header helpers.

use std::collections::HashMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Header names are matched case-insensitively.
pub type Headers = HashMap<String, String>;

/// Status codes the server uses to signal a ban or a limit violation.
pub const BAN_STATUS_CODES: [u16; 2] = [418, 429];

/// Look up a header value ignoring the case of its name.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// What the limiter needs to know about a settled request.
///
/// Both fields are optional: a transport failure without a response is
/// reported as an empty descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Headers,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self { status: Some(status), headers: Headers::new() }
    }

    /// Descriptor for a request that produced no response at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Server time from the `date` header, in epoch milliseconds.
    pub fn server_time_ms(&self) -> Option<u64> {
        let date = self.header_value("date")?;
        let parsed = DateTime::parse_from_rfc2822(date.trim()).ok()?;
        u64::try_from(parsed.timestamp_millis()).ok()
    }

    /// Numeric value of a usage header, if present and well formed.
    pub fn usage(&self, header: &str) -> Option<u64> {
        self.header_value(header)?.trim().parse().ok()
    }

    /// Ban duration in milliseconds when the response is a 418/429 carrying `retry-after`.
    pub fn ban_duration_ms(&self) -> Option<u64> {
        let status = self.status?;
        if !BAN_STATUS_CODES.contains(&status) {
            return None;
        }
        let seconds: f64 = self.header_value("retry-after")?.trim().parse().ok()?;
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        Some((seconds * 1_000.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = ResponseInfo::new(200).header("X-MBX-USED-WEIGHT-1M", "42");

        assert_eq!(response.header_value("x-mbx-used-weight-1m"), Some("42"));
        assert_eq!(response.usage("x-mbx-used-weight-1m"), Some(42));
        assert_eq!(response.usage("x-mbx-order-count-10s"), None);
    }

    #[test]
    fn test_server_time_from_http_date() {
        let response = ResponseInfo::new(200).header("Date", "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(response.server_time_ms(), Some(1_700_000_000_000));

        let garbage = ResponseInfo::new(200).header("date", "yesterday");
        assert_eq!(garbage.server_time_ms(), None);
        assert_eq!(ResponseInfo::empty().server_time_ms(), None);
    }

    #[test]
    fn test_ban_duration() {
        let teapot = ResponseInfo::new(418).header("Retry-After", "4");
        assert_eq!(teapot.ban_duration_ms(), Some(4_000));

        let too_many = ResponseInfo::new(429).header("retry-after", "1");
        assert_eq!(too_many.ban_duration_ms(), Some(1_000));

        // Order-count 429s come without retry-after and are handled by counters.
        assert_eq!(ResponseInfo::new(429).ban_duration_ms(), None);
        assert_eq!(ResponseInfo::new(503).header("retry-after", "4").ban_duration_ms(), None);
    }

    #[test]
    fn test_malformed_usage_is_ignored() {
        let response = ResponseInfo::new(200).header("x-mbx-used-weight-1m", "lots");
        assert_eq!(response.usage("x-mbx-used-weight-1m"), None);
    }
}
