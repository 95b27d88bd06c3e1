use thiserror::Error;

/// Classified failures surfaced by the orchestration pipeline. Validation
/// failures are rejected before any network call; the rest map one upstream
/// exchange to one error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Parse(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Cancelled(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        PipelineError::Parse(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Upstream(_) => "upstream",
            PipelineError::Parse(_) => "parse",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Cancelled(_) => "cancelled",
        }
    }
}

/// Fold a raw provider failure into the taxonomy. Request timeouts are the
/// one transport failure worth distinguishing; everything else from the wire
/// is an upstream fault.
pub fn classify_provider_error(err: anyhow::Error, timeout_secs: u64) -> PipelineError {
    for cause in err.chain() {
        if let Some(request_err) = cause.downcast_ref::<reqwest::Error>()
            && request_err.is_timeout()
        {
            return PipelineError::Timeout(timeout_secs);
        }
    }
    PipelineError::Upstream(format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn timeout_message_names_the_deadline() {
        assert_eq!(
            PipelineError::Timeout(45).to_string(),
            "request timed out after 45s"
        );
    }

    #[test]
    fn non_transport_errors_classify_as_upstream() {
        let err = classify_provider_error(anyhow!("Claude API error (500): boom"), 45);
        assert!(matches!(err, PipelineError::Upstream(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn transport_timeouts_classify_as_timeout() {
        // Bound but never accepted, so the request deadline fires.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(50))
            .build()
            .unwrap();
        let request_err = client
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap_err();
        assert!(request_err.is_timeout());

        // Wrapped the way provider call sites wrap failures, so the
        // classifier has to walk the chain.
        let err = anyhow::Error::new(request_err).context("request failed");
        let classified = classify_provider_error(err, 45);
        assert!(matches!(classified, PipelineError::Timeout(45)));
    }

    #[test]
    fn kinds_are_stable_identifiers() {
        assert_eq!(PipelineError::validation("x").kind(), "validation");
        assert_eq!(PipelineError::parse("x").kind(), "parse");
        assert_eq!(PipelineError::Timeout(1).kind(), "timeout");
    }
}
