use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::ProviderKind;

const MAX_RETRIES: usize = 5;
const BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Capped exponential backoff for one rate-limited request loop. `wait`
/// sleeps out the current delay (or the server's retry-after hint, if
/// longer) and doubles the schedule for the next round.
pub(crate) struct Backoff {
    attempt: usize,
    delay: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            attempt: 0,
            delay: BASE_DELAY,
        }
    }

    pub(crate) fn can_retry(&self) -> bool {
        self.attempt + 1 < MAX_RETRIES
    }

    pub(crate) async fn wait(&mut self, provider: ProviderKind, retry_after: Option<Duration>) {
        self.attempt += 1;
        let wait = match retry_after {
            Some(hint) if hint > self.delay => hint,
            _ => self.delay,
        };
        warn!(
            "{} rate limited; retrying in {:.1}s (attempt {}/{})",
            provider.as_str(),
            wait.as_secs_f32(),
            self.attempt,
            MAX_RETRIES
        );
        sleep(wait).await;
        self.advance();
    }

    fn advance(&mut self) {
        self.delay = (self.delay * 2).min(MAX_DELAY);
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.delay, Duration::from_secs(2));
        backoff.advance();
        assert_eq!(backoff.delay, Duration::from_secs(4));
        for _ in 0..8 {
            backoff.advance();
        }
        assert_eq!(backoff.delay, MAX_DELAY);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut backoff = Backoff::new();
        let mut waits = 0;
        while backoff.can_retry() {
            backoff.attempt += 1;
            waits += 1;
        }
        assert_eq!(waits, MAX_RETRIES - 1);
    }

    #[test]
    fn overloaded_body_counts_as_rate_limited() {
        assert!(is_rate_limited(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":{"type":"overloaded_error"}}"#
        ));
        assert!(!is_rate_limited(StatusCode::BAD_REQUEST, "invalid request"));
    }
}
