//! Capture session controller.
//!
//! One controller per enrollment screen. It owns the camera session, the
//! detection polling loop, the quality gate state, the captured still and the
//! submit guard. Every state change is published on a `watch` channel as a
//! [`CaptureView`]; one-off notifications go out on a `broadcast` channel.
//!
//! State lives behind a std mutex that is never held across an `.await`.
//! Async work captures the session token when it starts and re-checks it
//! under the lock when it completes; stale work is dropped without touching
//! any state.

use crate::api::{ApiError, CaptureApi, SubmitTarget};
use crate::camera::{CameraDevice, VideoStream};
use chrono::{DateTime, Utc};
use facegate_core::{
    CapturePhase, DetectionSample, GateState, IndicatorColor, QualityGate, SessionFence,
    SessionToken, SubmitOutcome, SubmitState,
};
use facegate_hw::{CameraError, Frame, FrameError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const MSG_STARTING: &str = "Starting camera…";
pub const MSG_CAMERA_STARTED: &str = "Camera started. Hold still and face the camera.";
pub const MSG_CAMERA_UNAVAILABLE: &str = "Camera permission denied or not available.";
pub const MSG_CAMERA_OFF: &str = "Camera is off";
pub const MSG_DETECTION_ERROR: &str = "Detection error";
pub const MSG_SETTLING: &str = "Hold still…";
pub const MSG_CAPTURE_FAILED: &str = "Camera not ready.";
pub const MSG_PREVIEW: &str = "Photo captured. Save it or retake.";
pub const MSG_SAVING: &str = "Saving...";

const EVENT_CAPACITY: usize = 16;

/// Timing and encoding knobs for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    pub dwell: Duration,
    /// Delay between the capture trigger and the still grab. Zero disables.
    pub settle_delay: Duration,
    pub detect_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(600),
            dwell: facegate_core::classifier::DEFAULT_DWELL,
            settle_delay: Duration::from_millis(300),
            detect_timeout: Duration::from_secs(5),
            jpeg_quality: 92,
        }
    }
}

/// Snapshot of everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureView {
    pub session: SessionToken,
    pub phase: CapturePhase,
    pub message: String,
    pub indicator: IndicatorColor,
    pub progress: u8,
    pub allow_capture: bool,
    pub submit: SubmitState,
    pub has_frame: bool,
    pub can_save: bool,
    pub can_retake: bool,
    pub captured_at: Option<DateTime<Utc>>,
}

/// One-off notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    CameraActive { session: SessionToken },
    CameraUnavailable { message: String },
    Captured { captured_at: DateTime<Utc> },
    SubmitFinished { outcome: SubmitOutcome },
}

/// Still frame held for preview and submit.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// `data:image/jpeg;base64,...`
    pub image: String,
    pub captured_at: DateTime<Utc>,
}

/// What a single poll tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No live session, or a detection request is already in flight.
    Skipped,
    /// The session changed while the request was out; result dropped.
    Stale,
    /// The sample was classified and applied.
    Applied,
    /// Transient failure; gate reset.
    Failed,
}

/// Failure of a grab-encode-post round trip.
#[derive(Error, Debug)]
pub(crate) enum FrameRequestError {
    #[error("frame grab failed: {0}")]
    Camera(#[from] CameraError),
    #[error("frame encode failed: {0}")]
    Encode(#[from] FrameError),
    #[error("request failed: {0}")]
    Api(#[from] ApiError),
    #[error("no result within {0:?}")]
    TimedOut(Duration),
}

struct State<S> {
    fence: SessionFence,
    phase: CapturePhase,
    gate: GateState,
    submit: SubmitState,
    stream: Option<S>,
    poller: Option<JoinHandle<()>>,
    /// Session whose detection request is currently outstanding.
    in_flight: Option<SessionToken>,
    frame: Option<CapturedFrame>,
    /// The held frame was rejected by the server and must be retaken.
    frame_rejected: bool,
}

impl<S> State<S> {
    fn new() -> Self {
        Self {
            fence: SessionFence::new(),
            phase: CapturePhase::Idle,
            gate: GateState::blocked(MSG_CAMERA_OFF, IndicatorColor::Red),
            submit: SubmitState::Idle,
            stream: None,
            poller: None,
            in_flight: None,
            frame: None,
            frame_rejected: false,
        }
    }

    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.in_flight = None;
    }

    fn view(&self) -> CaptureView {
        let has_frame = self.frame.is_some();
        CaptureView {
            session: self.fence.current(),
            phase: self.phase,
            message: self.gate.message.clone(),
            indicator: self.gate.indicator,
            progress: self.gate.progress,
            allow_capture: self.phase == CapturePhase::Live && self.gate.allow_capture,
            submit: self.submit,
            has_frame,
            can_save: has_frame && self.submit == SubmitState::Idle && !self.frame_rejected,
            can_retake: has_frame && self.submit != SubmitState::Submitting,
            captured_at: self.frame.as_ref().map(|f| f.captured_at),
        }
    }
}

struct Inner<C: CameraDevice, A: CaptureApi> {
    camera: C,
    api: A,
    target: SubmitTarget,
    config: ControllerConfig,
    gate: QualityGate,
    state: Mutex<State<C::Stream>>,
    /// Serializes camera acquisition so two streams are never held at once.
    start_lock: tokio::sync::Mutex<()>,
    view_tx: watch::Sender<CaptureView>,
    events: broadcast::Sender<CaptureEvent>,
}

impl<C: CameraDevice, A: CaptureApi> Inner<C, A> {
    fn lock(&self) -> MutexGuard<'_, State<C::Stream>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State<C::Stream>) {
        self.view_tx.send_replace(state.view());
    }

    fn emit(&self, event: CaptureEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Clone-safe handle to a capture controller.
pub struct CaptureController<C: CameraDevice, A: CaptureApi> {
    inner: Arc<Inner<C, A>>,
}

impl<C: CameraDevice, A: CaptureApi> Clone for CaptureController<C, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CameraDevice, A: CaptureApi> CaptureController<C, A> {
    pub fn new(camera: C, api: A, target: SubmitTarget, config: ControllerConfig) -> Self {
        let state = State::new();
        let (view_tx, _) = watch::channel(state.view());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                camera,
                api,
                target,
                gate: QualityGate::new(config.dwell),
                config,
                state: Mutex::new(state),
                start_lock: tokio::sync::Mutex::new(()),
                view_tx,
                events,
            }),
        }
    }

    pub fn target(&self) -> &SubmitTarget {
        &self.inner.target
    }

    pub fn view(&self) -> CaptureView {
        self.inner.lock().view()
    }

    pub fn watch(&self) -> watch::Receiver<CaptureView> {
        self.inner.view_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.inner.events.subscribe()
    }

    /// Open a new camera session and start polling.
    ///
    /// Any previous session is invalidated and its stream released before the
    /// camera is acquired again. Ignored while a submit is in progress or
    /// after a successful enrollment.
    pub async fn start(&self) {
        let _acquiring = self.inner.start_lock.lock().await;

        let (token, previous) = {
            let mut st = self.inner.lock();
            if st.submit == SubmitState::Submitting || st.phase == CapturePhase::Done {
                tracing::debug!(phase = ?st.phase, submit = ?st.submit, "start ignored");
                return;
            }
            let token = st.fence.advance();
            st.stop_polling();
            st.phase = CapturePhase::Starting;
            st.gate = GateState::blocked(MSG_STARTING, IndicatorColor::Red);
            st.submit = SubmitState::Idle;
            st.frame = None;
            st.frame_rejected = false;
            let previous = st.stream.take();
            self.inner.publish(&st);
            (token, previous)
        };

        if let Some(stream) = previous {
            stream.release().await;
        }

        tracing::info!(session = token.value(), "starting camera session");
        let acquired = self.inner.camera.acquire().await;

        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                let mut st = self.inner.lock();
                if !st.fence.is_current(token) {
                    return;
                }
                tracing::warn!(session = token.value(), error = %e, "camera unavailable");
                st.phase = CapturePhase::Idle;
                st.gate = GateState::blocked(MSG_CAMERA_UNAVAILABLE, IndicatorColor::Red);
                self.inner.publish(&st);
                self.inner.emit(CaptureEvent::CameraUnavailable {
                    message: e.to_string(),
                });
                return;
            }
        };

        let superseded = {
            let mut st = self.inner.lock();
            if st.fence.is_current(token) {
                st.stream = Some(stream.clone());
                st.phase = CapturePhase::Live;
                st.gate = GateState {
                    message: MSG_CAMERA_STARTED.to_string(),
                    ..GateState::default()
                };
                st.poller = Some(self.spawn_poller(token));
                self.inner.publish(&st);
                false
            } else {
                true
            }
        };

        if superseded {
            tracing::debug!(session = token.value(), "session superseded during acquisition");
            stream.release().await;
        } else {
            self.inner.emit(CaptureEvent::CameraActive { session: token });
        }
    }

    /// Fixed-interval loop firing one detached [`poll_tick`](Self::poll_tick)
    /// per period. Ticks that would overlap an outstanding request skip.
    fn spawn_poller(&self, token: SessionToken) -> JoinHandle<()> {
        let weak: Weak<Inner<C, A>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.lock().fence.is_current(token) {
                    return;
                }
                let controller = CaptureController { inner };
                tokio::spawn(async move {
                    controller.poll_tick().await;
                });
            }
        })
    }

    /// Grab a frame, post it for detection and apply the classified result.
    pub async fn poll_tick(&self) -> TickOutcome {
        let (token, stream) = {
            let mut st = self.inner.lock();
            if st.phase != CapturePhase::Live {
                return TickOutcome::Skipped;
            }
            let Some(stream) = st.stream.clone() else {
                return TickOutcome::Skipped;
            };
            let token = st.fence.current();
            if st.in_flight == Some(token) {
                tracing::trace!(session = token.value(), "detection in flight; tick skipped");
                return TickOutcome::Skipped;
            }
            st.in_flight = Some(token);
            (token, stream)
        };

        let result = self.detect(&stream).await;

        let mut st = self.inner.lock();
        if st.in_flight == Some(token) {
            st.in_flight = None;
        }
        if !st.fence.is_current(token) || st.phase != CapturePhase::Live {
            tracing::debug!(session = token.value(), "discarding stale detection result");
            return TickOutcome::Stale;
        }

        match result {
            Ok(sample) => {
                let now = tokio::time::Instant::now().into_std();
                st.gate = self.inner.gate.classify(&sample, &st.gate, now);
                tracing::trace!(
                    session = token.value(),
                    faces = sample.face_count,
                    allow = st.gate.allow_capture,
                    "detection applied"
                );
                self.inner.publish(&st);
                TickOutcome::Applied
            }
            Err(e) => {
                tracing::warn!(session = token.value(), error = %e, "detection failed");
                st.gate = GateState::blocked(MSG_DETECTION_ERROR, IndicatorColor::Red);
                self.inner.publish(&st);
                TickOutcome::Failed
            }
        }
    }

    async fn detect(&self, stream: &C::Stream) -> Result<DetectionSample, FrameRequestError> {
        let round_trip = async {
            let image = grab_encoded(stream, self.inner.config.jpeg_quality).await?;
            Ok::<_, FrameRequestError>(self.inner.api.detect(&image).await?)
        };
        let response = within(self.inner.config.detect_timeout, round_trip).await?;
        Ok(response.into())
    }

    /// Take the still. Returns whether a frame is now held for preview.
    ///
    /// Requires a live session whose gate allows capture. Polling stops and
    /// the session is fenced immediately; the still is grabbed after the
    /// settle delay and the camera is released.
    pub async fn capture(&self) -> bool {
        let (token, stream) = {
            let mut st = self.inner.lock();
            if st.phase != CapturePhase::Live
                || !st.gate.allow_capture
                || st.submit == SubmitState::Submitting
            {
                tracing::debug!(phase = ?st.phase, allow = st.gate.allow_capture, "capture ignored");
                return false;
            }
            let Some(stream) = st.stream.clone() else {
                return false;
            };
            let token = st.fence.advance();
            st.stop_polling();
            st.phase = CapturePhase::Settling;
            st.gate = GateState::blocked(MSG_SETTLING, IndicatorColor::Amber);
            self.inner.publish(&st);
            (token, stream)
        };

        if !self.inner.config.settle_delay.is_zero() {
            tokio::time::sleep(self.inner.config.settle_delay).await;
            if !self.inner.lock().fence.is_current(token) {
                return false;
            }
        }

        let grabbed = within(
            self.inner.config.detect_timeout,
            grab_encoded(&stream, self.inner.config.jpeg_quality),
        )
        .await;

        let (held, stream) = {
            let mut st = self.inner.lock();
            if !st.fence.is_current(token) {
                return false;
            }
            let stream = st.stream.take();
            let held = match grabbed {
                Ok(image) => {
                    let captured_at = Utc::now();
                    st.frame = Some(CapturedFrame { image, captured_at });
                    st.frame_rejected = false;
                    st.phase = CapturePhase::Preview;
                    st.gate = GateState::blocked(MSG_PREVIEW, IndicatorColor::Green);
                    tracing::info!(session = token.value(), "frame captured");
                    self.inner.publish(&st);
                    self.inner.emit(CaptureEvent::Captured { captured_at });
                    true
                }
                Err(e) => {
                    tracing::warn!(session = token.value(), error = %e, "capture failed");
                    st.phase = CapturePhase::Idle;
                    st.gate = GateState::blocked(MSG_CAPTURE_FAILED, IndicatorColor::Red);
                    self.inner.publish(&st);
                    false
                }
            };
            (held, stream)
        };

        if let Some(stream) = stream {
            stream.release().await;
        }
        held
    }

    /// Drop the held frame and open a fresh camera session.
    pub async fn retake(&self) {
        {
            let mut st = self.inner.lock();
            if st.frame.is_none() || st.submit == SubmitState::Submitting {
                tracing::debug!(submit = ?st.submit, "retake ignored");
                return;
            }
            st.frame = None;
            st.frame_rejected = false;
            st.submit = SubmitState::Idle;
        }
        self.start().await;
    }

    /// Submit the held frame. Returns `None` when the call was a no-op (no
    /// frame, a submit already running, already enrolled, or the frame was
    /// rejected and needs a retake).
    pub async fn save(&self) -> Option<SubmitOutcome> {
        let image = {
            let mut st = self.inner.lock();
            if st.submit != SubmitState::Idle {
                tracing::debug!(submit = ?st.submit, "save ignored");
                return None;
            }
            let image = st.frame.as_ref()?.image.clone();
            if st.frame_rejected {
                tracing::debug!("save ignored; rejected frame must be retaken");
                return None;
            }
            st.submit = SubmitState::Submitting;
            st.gate = GateState::blocked(MSG_SAVING, IndicatorColor::Amber);
            self.inner.publish(&st);
            image
        };

        let outcome = match self.inner.api.submit(&self.inner.target, &image).await {
            Ok(resp) => SubmitOutcome::from_response(&resp),
            Err(ApiError::Forbidden { message }) => {
                tracing::warn!(server_message = message.as_deref().unwrap_or(""), "submit forbidden");
                SubmitOutcome::forbidden()
            }
            Err(e) => {
                tracing::warn!(error = %e, "submit request failed");
                SubmitOutcome::transport_failure()
            }
        };

        let stream = {
            let mut st = self.inner.lock();
            match &outcome {
                SubmitOutcome::Accepted { message } => {
                    st.fence.advance();
                    st.stop_polling();
                    st.submit = SubmitState::Locked;
                    st.phase = CapturePhase::Done;
                    st.frame = None;
                    st.gate = GateState::blocked(message.clone(), IndicatorColor::Green);
                    tracing::info!(employee_id = %self.inner.target.employee_id, "enrollment accepted");
                }
                SubmitOutcome::Rejected { reason, message } => {
                    st.submit = SubmitState::Idle;
                    st.frame_rejected = true;
                    st.gate = GateState::blocked(message.clone(), IndicatorColor::Red);
                    tracing::info!(reason = ?reason, "enrollment rejected");
                }
                SubmitOutcome::Failed { message } => {
                    st.submit = SubmitState::Idle;
                    st.gate = GateState::blocked(message.clone(), IndicatorColor::Red);
                }
            }
            let stream = st.stream.take();
            self.inner.publish(&st);
            self.inner.emit(CaptureEvent::SubmitFinished {
                outcome: outcome.clone(),
            });
            stream
        };

        if let Some(stream) = stream {
            stream.release().await;
        }
        Some(outcome)
    }

    /// Turn the camera off and return to idle. No-op without a session.
    pub async fn stop(&self) {
        let stream = {
            let mut st = self.inner.lock();
            if st.submit == SubmitState::Submitting {
                tracing::debug!("stop ignored while submitting");
                return;
            }
            let idle = matches!(st.phase, CapturePhase::Idle | CapturePhase::Done);
            if idle && st.stream.is_none() && st.poller.is_none() {
                return;
            }
            let token = st.fence.advance();
            st.stop_polling();
            st.phase = CapturePhase::Idle;
            st.gate = GateState::blocked(MSG_CAMERA_OFF, IndicatorColor::Red);
            st.frame = None;
            st.frame_rejected = false;
            tracing::info!(session = token.value(), "camera session stopped");
            let stream = st.stream.take();
            self.inner.publish(&st);
            stream
        };

        if let Some(stream) = stream {
            stream.release().await;
        }
    }
}

/// Bound a whole grab-encode-post round trip. A stalled camera counts against
/// the same budget as a slow server.
pub(crate) async fn within<T>(
    limit: Duration,
    request: impl std::future::Future<Output = Result<T, FrameRequestError>>,
) -> Result<T, FrameRequestError> {
    tokio::time::timeout(limit, request)
        .await
        .map_err(|_| FrameRequestError::TimedOut(limit))?
}

pub(crate) async fn grab_encoded<S: VideoStream>(
    stream: &S,
    quality: u8,
) -> Result<String, FrameRequestError> {
    let frame: Frame = stream.grab().await?;
    Ok(frame.to_data_url(quality)?)
}
