use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static DNS_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)getaddrinfo|dns error|failed to lookup address|name or service not known|nodename nor servname|no such host",
    )
    .expect("valid dns failure pattern")
});

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl LLMError {
    /// True when the failure looks like the endpoint's hostname could not be resolved.
    pub fn is_dns_failure(&self) -> bool {
        match self {
            LLMError::Http(error) => {
                let mut message = error.to_string();
                let mut source = std::error::Error::source(error);
                while let Some(inner) = source {
                    message.push_str(": ");
                    message.push_str(&inner.to_string());
                    source = inner.source();
                }
                DNS_FAILURE.is_match(&message)
            }
            LLMError::Provider(message) => DNS_FAILURE.is_match(message),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LLMError;

    #[test]
    fn detects_resolution_failures_in_provider_messages() {
        let error = LLMError::Provider("[Errno 11001] getaddrinfo failed".to_string());
        assert!(error.is_dns_failure());

        let error = LLMError::Provider("dns error: failed to lookup address information".to_string());
        assert!(error.is_dns_failure());
    }

    #[test]
    fn other_failures_are_not_dns() {
        assert!(!LLMError::Provider("unexpected status 500".to_string()).is_dns_failure());
        assert!(!LLMError::MissingApiKey("GEMINI_API_KEY").is_dns_failure());
    }
}
