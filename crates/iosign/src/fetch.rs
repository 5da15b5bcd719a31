//! Input sources and bounded retry.
//!
//! Certificates, keys and provisioning profiles reach a CI job in three
//! shapes: a file on disk, a URL on an artifact server, or a base64 blob in
//! a secret variable. [`Source`] normalizes all three into bytes. Only URL
//! sources touch the network, and only they are retried, with exponential
//! backoff capped by [`RetryPolicy`].

use crate::{Error, Result};
use base64::Engine;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const MIN_ATTEMPTS: u32 = 3;
const MAX_ATTEMPTS: u32 = 5;
const INLINE_PREFIX: &str = "base64:";

/// Where an input's bytes come from.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Source {
    /// A local file.
    Path(PathBuf),
    /// An `http://` or `https://` URL.
    Url(String),
    /// Base64 data given inline as `base64:<data>`.
    Inline(String),
}

impl Source {
    /// Short label for logs and error messages. Inline data is never echoed.
    pub fn label(&self) -> String {
        match self {
            Source::Path(p) => p.display().to_string(),
            Source::Url(u) => u.clone(),
            Source::Inline(data) => format!("<inline base64, {} chars>", data.len()),
        }
    }

    /// Resolve the source into bytes.
    ///
    /// URL sources are fetched with `policy`; paths and inline data are
    /// read once.
    pub fn load(&self, policy: &RetryPolicy) -> Result<Vec<u8>> {
        match self {
            Source::Path(path) => fs::read(path).map_err(|e| Error::Fetch {
                source_name: path.display().to_string(),
                attempts: 1,
                reason: e.to_string(),
            }),
            Source::Inline(data) => {
                let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
                base64::engine::general_purpose::STANDARD
                    .decode(cleaned)
                    .map_err(|e| Error::Fetch {
                        source_name: self.label(),
                        attempts: 1,
                        reason: format!("not valid base64: {}", e),
                    })
            }
            Source::Url(url) => fetch_url(url, policy),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Source::Url(u) => f.debug_tuple("Url").field(u).finish(),
            Source::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty source".into()));
        }
        if let Some(data) = s.strip_prefix(INLINE_PREFIX) {
            return Ok(Source::Inline(data.to_string()));
        }
        if s.starts_with("https://") || s.starts_with("http://") {
            return Ok(Source::Url(s.to_string()));
        }
        Ok(Source::Path(PathBuf::from(s)))
    }
}

impl TryFrom<String> for Source {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Retry budget for network fetches.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    base_delay_ms: u64,
}

fn default_attempts() -> u32 {
    MIN_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to 3..=5.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    /// Effective attempt budget, always within 3..=5.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS)
    }

    /// Delay before attempt `attempt + 1`, doubling each time.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Every failure is logged with
/// its reason; the last reason is carried into [`Error::Fetch`].
pub fn retry_with_backoff<T, E, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    E: fmt::Display,
    F: FnMut(u32) -> std::result::Result<T, E>,
{
    let attempts = policy.max_attempts();
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(source = label, attempt, "fetch succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                last_reason = e.to_string();
                warn!(source = label, attempt, max_attempts = attempts, reason = %last_reason, "fetch attempt failed");
                if attempt < attempts {
                    thread::sleep(policy.delay_after(attempt));
                }
            }
        }
    }

    Err(Error::Fetch {
        source_name: label.to_string(),
        attempts,
        reason: last_reason,
    })
}

fn fetch_url(url: &str, policy: &RetryPolicy) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| Error::Fetch {
            source_name: url.to_string(),
            attempts: 0,
            reason: format!("failed to build HTTP client: {}", e),
        })?;

    retry_with_backoff(policy, url, |_| -> std::result::Result<Vec<u8>, String> {
        let response = client.get(url).send().map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }
        let bytes = response.bytes().map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            "certs/dist.p12".parse::<Source>().unwrap(),
            Source::Path(PathBuf::from("certs/dist.p12"))
        );
        assert!(matches!(
            "https://example.com/a.p12".parse::<Source>().unwrap(),
            Source::Url(_)
        ));
        assert!(matches!(
            "base64:aGVsbG8=".parse::<Source>().unwrap(),
            Source::Inline(_)
        ));
        assert!("   ".parse::<Source>().is_err());
    }

    #[test]
    fn test_inline_source_decodes() {
        let source: Source = "base64:aGVs\nbG8=".parse().unwrap();
        assert_eq!(source.load(&RetryPolicy::default()).unwrap(), b"hello");
    }

    #[test]
    fn test_inline_source_never_leaks_in_debug() {
        let source: Source = "base64:c2VjcmV0".parse().unwrap();
        assert_eq!(format!("{:?}", source), "Inline(..)");
        assert!(!source.label().contains("c2VjcmV0"));
    }

    #[test]
    fn test_missing_path_is_fetch_error() {
        let source = Source::Path(PathBuf::from("/nonexistent/profile.mobileprovision"));
        let err = source.load(&RetryPolicy::default()).unwrap_err();
        assert!(matches!(err, Error::Fetch { attempts: 1, .. }));
    }

    #[test]
    fn test_attempts_are_clamped() {
        assert_eq!(instant_policy(0).max_attempts(), 3);
        assert_eq!(instant_policy(4).max_attempts(), 4);
        assert_eq!(instant_policy(50).max_attempts(), 5);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_succeeds_on_later_attempt() {
        let calls = Cell::new(0);
        let value = retry_with_backoff(&instant_policy(3), "flaky", |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err("connection reset")
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retry_is_bounded() {
        let calls = Cell::new(0);
        let err = retry_with_backoff::<(), _, _>(&instant_policy(100), "down", |_| {
            calls.set(calls.get() + 1);
            Err("HTTP 503")
        })
        .unwrap_err();
        assert_eq!(calls.get(), 5);
        match err {
            Error::Fetch { attempts, reason, .. } => {
                assert_eq!(attempts, 5);
                assert_eq!(reason, "HTTP 503");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
