//! Interpretation of enrollment/update submit responses.

use crate::types::{SubmitResponse, SubmitStatus};
use serde::Serialize;

pub const MSG_ENROLLED: &str = "Face enrolled successfully!";
pub const MSG_QUALITY_FAILED: &str = "Face quality issues detected";
pub const MSG_NO_FACE: &str = "No face detected";
pub const MSG_DUPLICATE: &str = "Face already enrolled";
pub const MSG_FAILED: &str = "Enrollment failed";
pub const MSG_NETWORK_ERROR: &str = "Network error occurred";
pub const MSG_FORBIDDEN: &str = "Request rejected by security check. Reload the page and try again";

/// Server-side rejection the user can recover from by retaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    QualityFailed,
    NoFace,
    Duplicate,
}

/// Result of one submit attempt, as surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted { message: String },
    Rejected { reason: RejectReason, message: String },
    /// Server error, unrecognized status, or transport failure.
    Failed { message: String },
}

impl SubmitOutcome {
    pub fn from_response(resp: &SubmitResponse) -> Self {
        let server_text = |primary: &Option<String>, fallback: &str| {
            primary
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(fallback)
                .to_string()
        };

        match resp.status {
            SubmitStatus::Success => SubmitOutcome::Accepted {
                message: server_text(&resp.message, MSG_ENROLLED),
            },
            SubmitStatus::QualityFailed => SubmitOutcome::Rejected {
                reason: RejectReason::QualityFailed,
                message: server_text(
                    &resp.feedback.clone().or_else(|| resp.message.clone()),
                    MSG_QUALITY_FAILED,
                ),
            },
            SubmitStatus::NoFace => SubmitOutcome::Rejected {
                reason: RejectReason::NoFace,
                message: server_text(&resp.message, MSG_NO_FACE),
            },
            SubmitStatus::Duplicate => SubmitOutcome::Rejected {
                reason: RejectReason::Duplicate,
                message: server_text(&resp.message, MSG_DUPLICATE),
            },
            SubmitStatus::Error | SubmitStatus::Unrecognized => {
                tracing::warn!(
                    status = ?resp.status,
                    server_message = resp.message.as_deref().unwrap_or(""),
                    "submit failed"
                );
                SubmitOutcome::Failed {
                    message: MSG_FAILED.to_string(),
                }
            }
        }
    }

    pub fn transport_failure() -> Self {
        SubmitOutcome::Failed {
            message: MSG_NETWORK_ERROR.to_string(),
        }
    }

    pub fn forbidden() -> Self {
        SubmitOutcome::Failed {
            message: MSG_FORBIDDEN.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SubmitOutcome::Accepted { message }
            | SubmitOutcome::Rejected { message, .. }
            | SubmitOutcome::Failed { message } => message,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: SubmitStatus, message: Option<&str>, feedback: Option<&str>) -> SubmitResponse {
        SubmitResponse {
            status,
            message: message.map(String::from),
            feedback: feedback.map(String::from),
        }
    }

    #[test]
    fn test_duplicate_surfaces_server_text() {
        let out = SubmitOutcome::from_response(&resp(
            SubmitStatus::Duplicate,
            Some("Already enrolled"),
            None,
        ));
        assert_eq!(
            out,
            SubmitOutcome::Rejected {
                reason: RejectReason::Duplicate,
                message: "Already enrolled".into()
            }
        );
    }

    #[test]
    fn test_quality_failed_prefers_feedback() {
        let out = SubmitOutcome::from_response(&resp(
            SubmitStatus::QualityFailed,
            Some("Quality check failed"),
            Some("Image too blurry"),
        ));
        assert_eq!(out.message(), "Image too blurry");

        let out = SubmitOutcome::from_response(&resp(SubmitStatus::QualityFailed, None, None));
        assert_eq!(out.message(), MSG_QUALITY_FAILED);
    }

    #[test]
    fn test_blank_server_text_falls_back() {
        let out = SubmitOutcome::from_response(&resp(SubmitStatus::NoFace, Some("  "), None));
        assert_eq!(out.message(), MSG_NO_FACE);
    }

    #[test]
    fn test_error_and_unrecognized_are_generic() {
        for status in [SubmitStatus::Error, SubmitStatus::Unrecognized] {
            let out = SubmitOutcome::from_response(&resp(status, Some("Traceback: ..."), None));
            assert_eq!(
                out,
                SubmitOutcome::Failed {
                    message: MSG_FAILED.into()
                }
            );
        }
    }

    #[test]
    fn test_success() {
        let out = SubmitOutcome::from_response(&resp(SubmitStatus::Success, None, None));
        assert!(out.is_accepted());
        assert_eq!(out.message(), MSG_ENROLLED);
    }
}
