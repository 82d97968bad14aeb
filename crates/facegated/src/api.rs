//! JSON-over-HTTP client for the attendance server.

use crate::config::{Config, Endpoints};
use facegate_core::{DetectionResponse, RecognizeResponse, SubmitResponse};
use reqwest::header::COOKIE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the page's anti-forgery token.
pub const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),
    #[error("request forbidden (HTTP 403): {}", .message.as_deref().unwrap_or("no message"))]
    Forbidden { message: Option<String> },
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Transport(e)
        }
    }
}

/// Which record a captured face is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    /// First enrollment of an employee's face.
    Enroll,
    /// Replacement of an existing enrollment.
    Update,
}

/// Identity a capture screen submits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitTarget {
    pub employee_id: String,
    pub kind: SubmitKind,
}

/// Requests the capture flow makes against the server.
pub trait CaptureApi: Send + Sync + 'static {
    /// Post one preview frame for face/distance/lighting detection.
    fn detect(
        &self,
        image: &str,
    ) -> impl Future<Output = Result<DetectionResponse, ApiError>> + Send;

    /// Post the captured still for enrollment or update.
    fn submit(
        &self,
        target: &SubmitTarget,
        image: &str,
    ) -> impl Future<Output = Result<SubmitResponse, ApiError>> + Send;

    /// Post a kiosk frame for recognition and attendance marking.
    fn recognize(
        &self,
        frame: &str,
    ) -> impl Future<Output = Result<RecognizeResponse, ApiError>> + Send;
}

impl<T: CaptureApi> CaptureApi for Arc<T> {
    fn detect(
        &self,
        image: &str,
    ) -> impl Future<Output = Result<DetectionResponse, ApiError>> + Send {
        (**self).detect(image)
    }

    fn submit(
        &self,
        target: &SubmitTarget,
        image: &str,
    ) -> impl Future<Output = Result<SubmitResponse, ApiError>> + Send {
        (**self).submit(target, image)
    }

    fn recognize(
        &self,
        frame: &str,
    ) -> impl Future<Output = Result<RecognizeResponse, ApiError>> + Send {
        (**self).recognize(frame)
    }
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: &'a str,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    employee_id: &'a str,
    image: &'a str,
}

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    frame: &'a str,
}

/// Body of a rejected request, used only to recover the server's message.
#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// [`CaptureApi`] over reqwest.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    csrf_token: Option<String>,
    session_cookie: Option<String>,
    endpoints: Endpoints,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(concat!("facegated/", env!("CARGO_PKG_VERSION")))
            .build()?;

        if config.csrf_token.is_none() {
            tracing::warn!("no CSRF token configured; the server will reject POST requests");
        }

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            csrf_token: config.csrf_token.clone(),
            session_cookie: config.session_cookie.clone(),
            endpoints: config.endpoints.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// JSON POST carrying the anti-forgery token and session cookie.
    fn request<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = &self.csrf_token {
            req = req.header(CSRF_HEADER, token);
        }
        if let Some(cookie) = &self.session_cookie {
            req = req.header(COOKIE, cookie);
        }
        req
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let resp = self.request(&url, body).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        tracing::trace!(url = %url, status = status.as_u16(), len = bytes.len(), "response received");

        decode_body(status, &bytes)
    }
}

/// Decode a response body. Non-2xx bodies are accepted when they parse as
/// `T`, since the server reports application errors as JSON with 4xx/5xx.
fn decode_body<T: DeserializeOwned>(status: StatusCode, bytes: &[u8]) -> Result<T, ApiError> {
    if status == StatusCode::FORBIDDEN {
        let message = serde_json::from_slice::<ErrorBody>(bytes)
            .ok()
            .and_then(|b| b.message);
        return Err(ApiError::Forbidden { message });
    }

    match serde_json::from_slice::<T>(bytes) {
        Ok(value) => Ok(value),
        Err(e) if status.is_success() => Err(ApiError::Decode(e.to_string())),
        Err(_) => Err(ApiError::Status(status.as_u16())),
    }
}

impl CaptureApi for HttpApi {
    async fn detect(&self, image: &str) -> Result<DetectionResponse, ApiError> {
        self.post(&self.endpoints.detect, &DetectRequest { image })
            .await
    }

    async fn submit(&self, target: &SubmitTarget, image: &str) -> Result<SubmitResponse, ApiError> {
        let path = match target.kind {
            SubmitKind::Enroll => &self.endpoints.enroll,
            SubmitKind::Update => &self.endpoints.update,
        };
        tracing::info!(employee_id = %target.employee_id, kind = ?target.kind, "submitting capture");
        self.post(
            path,
            &SubmitRequest {
                employee_id: &target.employee_id,
                image,
            },
        )
        .await
    }

    async fn recognize(&self, frame: &str) -> Result<RecognizeResponse, ApiError> {
        self.post(&self.endpoints.recognize, &RecognizeRequest { frame })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::SubmitStatus;

    #[test]
    fn test_forbidden_keeps_server_message() {
        let err = decode_body::<SubmitResponse>(
            StatusCode::FORBIDDEN,
            br#"{"status": "error", "message": "Liveness check required"}"#,
        )
        .unwrap_err();
        match err {
            ApiError::Forbidden { message } => {
                assert_eq!(message.as_deref(), Some("Liveness check required"))
            }
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[test]
    fn test_forbidden_html_body() {
        let err = decode_body::<SubmitResponse>(StatusCode::FORBIDDEN, b"<html>CSRF</html>")
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden { message: None }));
    }

    #[test]
    fn test_error_status_with_json_body_is_decoded() {
        let resp = decode_body::<SubmitResponse>(
            StatusCode::INTERNAL_SERVER_ERROR,
            br#"{"status": "error", "message": "db down"}"#,
        )
        .unwrap();
        assert_eq!(resp.status, SubmitStatus::Error);
    }

    #[test]
    fn test_error_status_without_json_body() {
        let err = decode_body::<SubmitResponse>(StatusCode::BAD_GATEWAY, b"bad gateway")
            .unwrap_err();
        assert!(matches!(err, ApiError::Status(502)));
    }

    #[test]
    fn test_malformed_success_body() {
        let err = decode_body::<DetectionResponse>(StatusCode::OK, br#"{"faces": 1}"#)
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn test_post_carries_csrf_token_and_cookie() {
        let config = Config {
            csrf_token: Some("tok-123".into()),
            session_cookie: Some("session=abc".into()),
            ..Config::default()
        };
        let api = HttpApi::new(&config).unwrap();
        let url = api.url(&config.endpoints.enroll);
        let req = api
            .request(&url, &SubmitRequest { employee_id: "E7", image: "data:," })
            .build()
            .unwrap();

        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().path(), "/enroll/capture");
        assert_eq!(req.headers()[CSRF_HEADER], "tok-123");
        assert_eq!(req.headers()[COOKIE], "session=abc");
        assert_eq!(req.headers()[reqwest::header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_post_without_token_omits_header() {
        let api = HttpApi::new(&Config::default()).unwrap();
        let req = api
            .request(&api.url("/kiosk/recognize"), &RecognizeRequest { frame: "data:," })
            .build()
            .unwrap();
        assert!(req.headers().get(CSRF_HEADER).is_none());
    }

    #[test]
    fn test_url_join() {
        let config = Config {
            server_url: "http://kiosk.local:5000/".into(),
            ..Config::default()
        };
        let api = HttpApi::new(&config).unwrap();
        assert_eq!(api.url("/enroll/detect_face"), "http://kiosk.local:5000/enroll/detect_face");
        assert_eq!(api.url("kiosk/recognize"), "http://kiosk.local:5000/kiosk/recognize");
    }
}
