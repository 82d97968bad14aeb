//! Kiosk recognition loop.
//!
//! Streams frames to the recognition endpoint at a fixed interval and turns
//! attendance results into [`KioskEvent`]s. Shares the controller's fencing
//! and single in-flight rules; there is no quality gate or capture step.

use crate::api::{ApiError, CaptureApi};
use crate::camera::{CameraDevice, VideoStream};
use crate::controller::{grab_encoded, within, FrameRequestError};
use facegate_core::{RecognizeResponse, RecognizeStatus, SessionFence, SessionToken};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const EVENT_CAPACITY: usize = 32;
/// Server message on a 403 that means the attendee must pass liveness first.
/// Any other 403 (expired session, bad CSRF token) is a plain failure.
const LIVENESS_REQUIRED: &str = "Liveness check required";

#[derive(Debug, Clone)]
pub struct KioskConfig {
    pub poll_interval: Duration,
    /// No frames are sent for this long after a match.
    pub debounce: Duration,
    pub request_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(650),
            debounce: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            jpeg_quality: 70,
        }
    }
}

/// Identity fields shown on the kiosk card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attendee {
    pub name: Option<String>,
    pub dept: Option<String>,
    pub time: Option<String>,
    pub photo_url: Option<String>,
}

impl From<&RecognizeResponse> for Attendee {
    fn from(resp: &RecognizeResponse) -> Self {
        Self {
            name: resp.name.clone(),
            dept: resp.dept.clone(),
            time: resp.time.clone(),
            photo_url: resp.photo_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    CheckIn,
    CheckOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KioskEvent {
    CameraActive,
    CameraUnavailable { message: String },
    Marked { direction: Direction, attendee: Attendee },
    AlreadyMarked { attendee: Attendee },
    Unknown { time: Option<String> },
    /// The server wants the liveness check repeated before recognizing.
    LivenessRequired,
}

impl KioskEvent {
    /// Map a recognition response to an event. `ignore`, `error` and
    /// unrecognized statuses produce none.
    pub fn from_response(resp: &RecognizeResponse) -> Option<Self> {
        match resp.status {
            RecognizeStatus::CheckIn => Some(KioskEvent::Marked {
                direction: Direction::CheckIn,
                attendee: resp.into(),
            }),
            RecognizeStatus::CheckOut => Some(KioskEvent::Marked {
                direction: Direction::CheckOut,
                attendee: resp.into(),
            }),
            RecognizeStatus::Already => Some(KioskEvent::AlreadyMarked {
                attendee: resp.into(),
            }),
            RecognizeStatus::Unknown => Some(KioskEvent::Unknown {
                time: resp.time.clone(),
            }),
            RecognizeStatus::Ignore | RecognizeStatus::Error | RecognizeStatus::Unrecognized => {
                None
            }
        }
    }

    fn is_match(&self) -> bool {
        matches!(self, KioskEvent::Marked { .. } | KioskEvent::AlreadyMarked { .. })
    }
}

struct State<S> {
    fence: SessionFence,
    stream: Option<S>,
    poller: Option<JoinHandle<()>>,
    in_flight: Option<SessionToken>,
    last_match: Option<Instant>,
}

struct Inner<C: CameraDevice, A: CaptureApi> {
    camera: C,
    api: A,
    config: KioskConfig,
    state: Mutex<State<C::Stream>>,
    start_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<KioskEvent>,
}

impl<C: CameraDevice, A: CaptureApi> Inner<C, A> {
    fn lock(&self) -> MutexGuard<'_, State<C::Stream>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: KioskEvent) {
        let _ = self.events.send(event);
    }
}

/// Clone-safe handle to the kiosk loop.
pub struct RecognitionLoop<C: CameraDevice, A: CaptureApi> {
    inner: Arc<Inner<C, A>>,
}

impl<C: CameraDevice, A: CaptureApi> Clone for RecognitionLoop<C, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CameraDevice, A: CaptureApi> RecognitionLoop<C, A> {
    pub fn new(camera: C, api: A, config: KioskConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                camera,
                api,
                config,
                state: Mutex::new(State {
                    fence: SessionFence::new(),
                    stream: None,
                    poller: None,
                    in_flight: None,
                    last_match: None,
                }),
                start_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KioskEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().poller.is_some()
    }

    /// Acquire the camera and start recognizing. Restarts if already running.
    pub async fn start(&self) {
        let _acquiring = self.inner.start_lock.lock().await;

        let (token, previous) = {
            let mut st = self.inner.lock();
            let token = st.fence.advance();
            if let Some(poller) = st.poller.take() {
                poller.abort();
            }
            st.in_flight = None;
            st.last_match = None;
            (token, st.stream.take())
        };
        if let Some(stream) = previous {
            stream.release().await;
        }

        let stream = match self.inner.camera.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                if self.inner.lock().fence.is_current(token) {
                    tracing::warn!(error = %e, "kiosk camera unavailable");
                    self.inner.emit(KioskEvent::CameraUnavailable {
                        message: e.to_string(),
                    });
                }
                return;
            }
        };

        let superseded = {
            let mut st = self.inner.lock();
            if st.fence.is_current(token) {
                st.stream = Some(stream.clone());
                st.poller = Some(self.spawn_poller(token));
                false
            } else {
                true
            }
        };

        if superseded {
            stream.release().await;
        } else {
            tracing::info!(session = token.value(), "kiosk recognition started");
            self.inner.emit(KioskEvent::CameraActive);
        }
    }

    fn spawn_poller(&self, token: SessionToken) -> JoinHandle<()> {
        let weak: Weak<Inner<C, A>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.lock().fence.is_current(token) {
                    return;
                }
                let kiosk = RecognitionLoop { inner };
                tokio::spawn(async move {
                    kiosk.recognize_tick().await;
                });
            }
        })
    }

    /// Send one frame for recognition. Returns the event emitted, if any.
    pub async fn recognize_tick(&self) -> Option<KioskEvent> {
        let (token, stream) = {
            let mut st = self.inner.lock();
            let stream = st.stream.clone()?;
            let token = st.fence.current();
            if st.in_flight == Some(token) {
                return None;
            }
            if let Some(last) = st.last_match {
                if last.elapsed() < self.inner.config.debounce {
                    return None;
                }
            }
            st.in_flight = Some(token);
            (token, stream)
        };

        let result = self.recognize(&stream).await;

        let mut st = self.inner.lock();
        if st.in_flight == Some(token) {
            st.in_flight = None;
        }
        if !st.fence.is_current(token) {
            tracing::debug!(session = token.value(), "discarding stale recognition result");
            return None;
        }

        let event = match result {
            Ok(resp) => KioskEvent::from_response(&resp),
            Err(FrameRequestError::Api(ApiError::Forbidden { message }))
                if message.as_deref() == Some(LIVENESS_REQUIRED) =>
            {
                tracing::debug!("recognition refused pending liveness check");
                Some(KioskEvent::LivenessRequired)
            }
            Err(e) => {
                tracing::debug!(error = %e, "recognition failed");
                None
            }
        };

        let event = event?;
        if event.is_match() {
            st.last_match = Some(Instant::now());
        }
        drop(st);

        tracing::info!(event = ?event, "kiosk recognition");
        self.inner.emit(event.clone());
        Some(event)
    }

    async fn recognize(&self, stream: &C::Stream) -> Result<RecognizeResponse, FrameRequestError> {
        let round_trip = async {
            let image = grab_encoded(stream, self.inner.config.jpeg_quality).await?;
            Ok::<_, FrameRequestError>(self.inner.api.recognize(&image).await?)
        };
        within(self.inner.config.request_timeout, round_trip).await
    }

    /// Stop recognizing and release the camera.
    pub async fn stop(&self) {
        let stream = {
            let mut st = self.inner.lock();
            // Also fences a start that is still acquiring the camera.
            let token = st.fence.advance();
            st.in_flight = None;
            if let Some(poller) = st.poller.take() {
                poller.abort();
                tracing::info!(session = token.value(), "kiosk recognition stopped");
            }
            st.stream.take()
        };
        if let Some(stream) = stream {
            stream.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{recognition, FakeApi, FakeCamera};
    use std::sync::atomic::Ordering;

    type TestLoop = RecognitionLoop<Arc<FakeCamera>, Arc<FakeApi>>;

    fn kiosk(api: FakeApi) -> (TestLoop, Arc<FakeCamera>, Arc<FakeApi>) {
        let camera = Arc::new(FakeCamera::default());
        let api = Arc::new(api);
        let config = KioskConfig {
            poll_interval: Duration::from_secs(3600),
            ..KioskConfig::default()
        };
        let kiosk = RecognitionLoop::new(Arc::clone(&camera), Arc::clone(&api), config);
        (kiosk, camera, api)
    }

    fn matched(status: RecognizeStatus, name: &str) -> RecognizeResponse {
        RecognizeResponse {
            name: Some(name.into()),
            dept: Some("Ops".into()),
            time: Some("09:02".into()),
            ..recognition(status)
        }
    }

    #[test]
    fn test_event_mapping() {
        let event = KioskEvent::from_response(&matched(RecognizeStatus::CheckOut, "Asha")).unwrap();
        match event {
            KioskEvent::Marked { direction, attendee } => {
                assert_eq!(direction, Direction::CheckOut);
                assert_eq!(attendee.name.as_deref(), Some("Asha"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(KioskEvent::from_response(&recognition(RecognizeStatus::Ignore)).is_none());
        assert!(KioskEvent::from_response(&recognition(RecognizeStatus::Error)).is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(KioskEvent::Marked {
            direction: Direction::CheckIn,
            attendee: Attendee::from(&matched(RecognizeStatus::CheckIn, "Asha")),
        })
        .unwrap();
        assert_eq!(json["event"], "marked");
        assert_eq!(json["direction"], "check_in");
        assert_eq!(json["attendee"]["dept"], "Ops");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_without_camera_does_nothing() {
        let (kiosk, _, api) = kiosk(FakeApi::default());
        assert!(kiosk.recognize_tick().await.is_none());
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_is_debounced() {
        let (kiosk, _, api) = kiosk(FakeApi::default());
        api.push_recognition(Ok(matched(RecognizeStatus::CheckIn, "Asha")));
        kiosk.start().await;

        let event = kiosk.recognize_tick().await;
        assert!(matches!(event, Some(KioskEvent::Marked { .. })));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(kiosk.recognize_tick().await.is_none());
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(400)).await;
        kiosk.recognize_tick().await;
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_is_not_debounced() {
        let (kiosk, _, api) = kiosk(FakeApi::default());
        api.push_recognition(Ok(recognition(RecognizeStatus::Unknown)));
        kiosk.start().await;

        assert!(matches!(kiosk.recognize_tick().await, Some(KioskEvent::Unknown { .. })));
        assert!(matches!(kiosk.recognize_tick().await, Some(KioskEvent::Unknown { .. })));
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_requires_liveness() {
        let (kiosk, _, api) = kiosk(FakeApi::default());
        api.push_recognition(Err(ApiError::Forbidden {
            message: Some("Liveness check required".into()),
        }));
        api.push_recognition(Ok(recognition(RecognizeStatus::Ignore)));
        let mut events = kiosk.subscribe();
        kiosk.start().await;

        assert_eq!(kiosk.recognize_tick().await, Some(KioskEvent::LivenessRequired));
        assert_eq!(events.recv().await.unwrap(), KioskEvent::CameraActive);
        assert_eq!(events.recv().await.unwrap(), KioskEvent::LivenessRequired);
        assert!(kiosk.recognize_tick().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_forbidden_is_silent() {
        let (kiosk, _, api) = kiosk(FakeApi::default());
        api.push_recognition(Err(ApiError::Forbidden { message: None }));
        api.push_recognition(Err(ApiError::Forbidden {
            message: Some("CSRF token missing".into()),
        }));
        let mut events = kiosk.subscribe();
        kiosk.start().await;

        assert!(kiosk.recognize_tick().await.is_none());
        assert!(kiosk.recognize_tick().await.is_none());
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 2);
        assert_eq!(events.recv().await.unwrap(), KioskEvent::CameraActive);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_camera_does_not_wedge_loop() {
        let (kiosk, camera, api) = kiosk(FakeApi::default());
        kiosk.start().await;
        camera.stalled.store(true, Ordering::SeqCst);

        // Paused time auto-advances to the request timeout.
        assert!(kiosk.recognize_tick().await.is_none());
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 0);

        camera.stalled.store(false, Ordering::SeqCst);
        api.push_recognition(Ok(recognition(RecognizeStatus::Unknown)));
        assert!(matches!(kiosk.recognize_tick().await, Some(KioskEvent::Unknown { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_camera_and_is_idempotent() {
        let (kiosk, camera, _) = kiosk(FakeApi::default());
        kiosk.start().await;
        assert!(kiosk.is_running());
        assert_eq!(camera.live.load(Ordering::SeqCst), 1);

        kiosk.stop().await;
        kiosk.stop().await;
        assert!(!kiosk.is_running());
        assert_eq!(camera.live.load(Ordering::SeqCst), 0);
        assert!(kiosk.recognize_tick().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_sends_frames() {
        let camera = Arc::new(FakeCamera::default());
        let api = Arc::new(FakeApi::default());
        let kiosk = RecognitionLoop::new(
            Arc::clone(&camera),
            Arc::clone(&api),
            KioskConfig::default(),
        );
        kiosk.start().await;

        tokio::time::sleep(Duration::from_millis(2000)).await;
        // Ticks at 650, 1300, 1950.
        assert_eq!(api.recognize_calls.load(Ordering::SeqCst), 3);
        kiosk.stop().await;
    }
}
