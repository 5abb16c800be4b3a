//! REST client for the segmentation inference service.
//!
//! Wraps the service's HTTP API (`POST /api/v1/segment`, health probe)
//! using [`reqwest`], and implements
//! [`WorkFunction`](cytoseg_core::work::WorkFunction) so the scheduler can
//! drive it directly.

use async_trait::async_trait;

use cytoseg_core::work::{WorkError, WorkFunction};

/// Default work endpoint: the segmentation route.
const SEGMENT_PATH: &str = "/api/v1/segment";

/// HTTP client for a single inference service instance.
pub struct InferenceClient {
    client: reqwest::Client,
    api_url: String,
    /// Path the work payload is POSTed to.
    work_path: String,
}

/// Errors from the inference REST layer.
#[derive(Debug, thiserror::Error)]
pub enum InferenceApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Inference API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for the server logs.
        body: String,
    },

    /// The service answered 2xx with a body that is not valid JSON.
    #[error("Malformed inference response: {0}")]
    MalformedResponse(String),
}

impl InferenceApiError {
    /// Whether a retry can plausibly succeed.
    ///
    /// Transport failures, 429 and 5xx are infrastructure conditions worth
    /// retrying; any other 4xx and a malformed body mean the request itself
    /// is wrong and will keep failing.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::ApiError { status, .. } => *status == 429 || (500..600).contains(status),
            Self::MalformedResponse(_) => false,
        }
    }
}

impl From<InferenceApiError> for WorkError {
    fn from(err: InferenceApiError) -> Self {
        // The full body stays in the server logs; callers get a terse,
        // redacted message.
        let message = match &err {
            InferenceApiError::Request(e) => format!("Inference request failed: {e}"),
            InferenceApiError::ApiError { status, body } => {
                tracing::warn!(status, body = %body, "Inference service returned an error");
                format!("Inference service returned HTTP {status}")
            }
            InferenceApiError::MalformedResponse(detail) => {
                tracing::warn!(detail = %detail, "Malformed inference response");
                "Inference service returned a malformed response".to_string()
            }
        };
        if err.is_transient() {
            WorkError::Transient(message)
        } else {
            WorkError::Permanent(message)
        }
    }
}

impl InferenceClient {
    /// Create a client for an inference service instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://inference:9090`.
    pub fn new(api_url: String) -> Self {
        Self { client: reqwest::Client::new(), api_url, work_path: SEGMENT_PATH.to_string() }
    }

    /// Create a client reusing an existing [`reqwest::Client`] (connection
    /// pooling across services).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url, work_path: SEGMENT_PATH.to_string() }
    }

    /// Create a client whose work payloads go to a different route on the
    /// same protocol (export rendering, upload ingestion).
    pub fn for_endpoint(client: reqwest::Client, api_url: String, work_path: &str) -> Self {
        Self { client, api_url, work_path: work_path.to_string() }
    }

    /// Run one work request.
    ///
    /// Sends `POST` to the configured work route (`/api/v1/segment` by
    /// default) with the job payload and the generation the result will be
    /// presented under.
    pub async fn segment(
        &self,
        payload: &serde_json::Value,
        generation: u64,
    ) -> Result<serde_json::Value, InferenceApiError> {
        let body = serde_json::json!({
            "payload": payload,
            "generation": generation,
        });

        let response = self
            .client
            .post(format!("{}{}", self.api_url, self.work_path))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Liveness probe (`GET /health`).
    pub async fn health(&self) -> Result<(), InferenceApiError> {
        let response = self.client.get(format!("{}/health", self.api_url)).send().await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, or surface the status
    /// and body as an [`InferenceApiError::ApiError`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, InferenceApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(InferenceApiError::ApiError { status: status.as_u16(), body });
        }
        Ok(response)
    }

    /// Check the status, then decode the body as JSON.
    async fn parse_response(
        response: reqwest::Response,
    ) -> Result<serde_json::Value, InferenceApiError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| InferenceApiError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl WorkFunction for InferenceClient {
    async fn invoke(
        &self,
        payload: serde_json::Value,
        generation: u64,
    ) -> Result<serde_json::Value, WorkError> {
        self.segment(&payload, generation).await.map_err(WorkError::from)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn api_error(status: u16) -> InferenceApiError {
        InferenceApiError::ApiError { status, body: "detail".to_string() }
    }

    // -- classification -------------------------------------------------------

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 504] {
            assert!(api_error(status).is_transient(), "HTTP {status} should be retryable");
        }
    }

    #[test]
    fn throttling_is_transient() {
        assert!(api_error(429).is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 404, 422] {
            assert!(!api_error(status).is_transient(), "HTTP {status} should be terminal");
        }
    }

    #[test]
    fn malformed_response_is_permanent() {
        let err = InferenceApiError::MalformedResponse("expected value".to_string());
        assert!(!err.is_transient());
        assert_matches!(WorkError::from(err), WorkError::Permanent(_));
    }

    #[test]
    fn classification_maps_into_work_error() {
        assert_matches!(WorkError::from(api_error(503)), WorkError::Transient(_));
        assert_matches!(WorkError::from(api_error(404)), WorkError::Permanent(_));
    }

    #[test]
    fn work_error_message_is_redacted() {
        let err = InferenceApiError::ApiError {
            status: 500,
            body: "Traceback (most recent call last): ...".to_string(),
        };
        let WorkError::Transient(message) = WorkError::from(err) else {
            panic!("expected transient");
        };
        assert!(!message.contains("Traceback"));
        assert!(message.contains("500"));
    }

    // -- transport ------------------------------------------------------------

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let client = InferenceClient::new("http://127.0.0.1:9".to_string());
        let err = client
            .segment(&serde_json::json!({}), 0)
            .await
            .expect_err("nothing listens on port 9");
        assert!(err.is_transient());
    }
}
