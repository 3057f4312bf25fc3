//! HTTP client for generation microservices.

use super::{GenerationProvider, ProviderError, ProviderRequest, ProviderResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Posts generation requests as JSON to `{base_url}/{capability}`.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    /// Creates a provider with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    /// Sets the bearer token sent with every request.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, request: &ProviderRequest) -> String {
        format!("{}/{}", self.base_url, request.capability)
    }
}

fn transport_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if let Some(status) = err.status() {
        ProviderError::Status {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        ProviderError::Connection(err.to_string())
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut builder = self
            .client
            .post(self.endpoint(&request))
            .header("Idempotency-Key", &request.request_id)
            .json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ProviderResponse>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}
