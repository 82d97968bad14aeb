use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Subject distance reported by the detection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    Far,
    Perfect,
    Close,
    /// Field absent, null, or a value this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Scene lighting reported by the detection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lighting {
    Dark,
    Good,
    Bright,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Raw body of a detection response.
///
/// Only `face_count` is mandatory; some server variants omit the distance and
/// lighting hints entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub face_count: u32,
    pub distance: Option<Distance>,
    pub lighting: Option<Lighting>,
}

/// One detection result, normalized so the classifier is total over its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionSample {
    pub face_count: u32,
    pub distance: Distance,
    pub lighting: Lighting,
}

impl DetectionSample {
    /// A single well-placed, well-lit face.
    pub fn clear() -> Self {
        Self {
            face_count: 1,
            distance: Distance::Perfect,
            lighting: Lighting::Good,
        }
    }

    pub fn faces(face_count: u32) -> Self {
        Self {
            face_count,
            distance: Distance::Unknown,
            lighting: Lighting::Unknown,
        }
    }
}

impl From<DetectionResponse> for DetectionSample {
    fn from(resp: DetectionResponse) -> Self {
        Self {
            face_count: resp.face_count,
            distance: resp.distance.unwrap_or_default(),
            lighting: resp.lighting.unwrap_or_default(),
        }
    }
}

/// Colour of the guidance frame drawn around the preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorColor {
    #[default]
    Red,
    Orange,
    Amber,
    Green,
}

impl IndicatorColor {
    /// CSS colour used by the web front end for this state.
    pub fn hex(self) -> &'static str {
        match self {
            IndicatorColor::Red => "#ef4444",
            IndicatorColor::Orange => "#f97316",
            IndicatorColor::Amber => "#f59e0b",
            IndicatorColor::Green => "#10b981",
        }
    }
}

/// Quality gate state for the current camera session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateState {
    /// When the current run of all-clear samples began.
    pub stability_started_at: Option<Instant>,
    pub allow_capture: bool,
    pub message: String,
    pub indicator: IndicatorColor,
    /// Dwell progress in percent (0–100).
    pub progress: u8,
}

impl GateState {
    /// Non-capturable state showing `message`, with the stability timer cleared.
    pub fn blocked(message: impl Into<String>, indicator: IndicatorColor) -> Self {
        Self {
            stability_started_at: None,
            allow_capture: false,
            message: message.into(),
            indicator,
            progress: 0,
        }
    }
}

impl Default for GateState {
    fn default() -> Self {
        Self::blocked("Align your face inside the box", IndicatorColor::Red)
    }
}

/// Lifecycle of the capture controller, as seen by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    /// No camera session.
    #[default]
    Idle,
    /// Waiting for the camera stream.
    Starting,
    /// Polling the detection endpoint.
    Live,
    /// Capture triggered, grabbing the still.
    Settling,
    /// Still frame held, awaiting retake or save.
    Preview,
    /// Enrollment accepted; the screen is finished.
    Done,
}

/// Re-entrancy guard for the submit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitState {
    #[default]
    Idle,
    Submitting,
    /// Terminal: the enrollment succeeded.
    Locked,
}

/// Status field of an enrollment/update response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Success,
    QualityFailed,
    NoFace,
    Duplicate,
    Error,
    #[serde(other)]
    Unrecognized,
}

/// Body of an enrollment/update response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    pub message: Option<String>,
    /// Human-readable quality feedback (sent with `quality_failed`).
    pub feedback: Option<String>,
}

/// Status field of a kiosk recognition response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecognizeStatus {
    CheckIn,
    CheckOut,
    Already,
    Unknown,
    Ignore,
    Error,
    #[serde(other)]
    Unrecognized,
}

/// Body of a kiosk recognition response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeResponse {
    pub status: RecognizeStatus,
    pub name: Option<String>,
    pub dept: Option<String>,
    pub time: Option<String>,
    #[serde(rename = "photoUrl")]
    pub photo_url: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}
