//! facegate-core — Frame quality gate and capture session primitives.
//!
//! Interprets detection samples returned by the attendance server into
//! capture guidance, fences stale asynchronous results by session, and
//! defines the JSON records exchanged with the server.

pub mod classifier;
pub mod fence;
pub mod submit;
pub mod types;

pub use classifier::QualityGate;
pub use fence::{SessionFence, SessionToken};
pub use submit::{RejectReason, SubmitOutcome};
pub use types::{
    CapturePhase, DetectionResponse, DetectionSample, Distance, GateState, IndicatorColor,
    Lighting, RecognizeResponse, RecognizeStatus, SubmitResponse, SubmitState, SubmitStatus,
};
