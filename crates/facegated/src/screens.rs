//! The screen currently driving the camera.
//!
//! At most one screen is open: an enrollment screen with its
//! [`CaptureController`], or the kiosk with its [`RecognitionLoop`]. Opening
//! a screen tears down the previous one first, so the camera is never held
//! twice. State and event changes of the open screen are serialized to JSON
//! and fanned out as [`Signal`]s.

use crate::api::{CaptureApi, SubmitKind, SubmitTarget};
use crate::camera::CameraDevice;
use crate::controller::{CaptureController, ControllerConfig};
use crate::kiosk::{KioskConfig, RecognitionLoop};
use facegate_core::SubmitOutcome;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const SIGNAL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ScreenError {
    #[error("no enrollment screen is open")]
    NoEnrollment,
    #[error("kiosk is not open")]
    NoKiosk,
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outbound notification, already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    StateChanged(String),
    Event(String),
}

enum Screen<C: CameraDevice, A: CaptureApi> {
    None,
    Enrollment {
        controller: CaptureController<C, A>,
        forwarder: JoinHandle<()>,
    },
    Kiosk {
        kiosk: RecognitionLoop<C, A>,
        forwarder: JoinHandle<()>,
    },
}

#[derive(Serialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
enum Status<V: Serialize> {
    None {
        version: &'static str,
    },
    Enrollment {
        version: &'static str,
        employee_id: String,
        update: bool,
        view: V,
    },
    Kiosk {
        version: &'static str,
        running: bool,
    },
}

pub struct Screens<C, A>
where
    C: CameraDevice + Clone,
    A: CaptureApi + Clone,
{
    camera: C,
    api: A,
    controller_config: ControllerConfig,
    kiosk_config: KioskConfig,
    current: Mutex<Screen<C, A>>,
    signals: broadcast::Sender<Signal>,
}

impl<C, A> Screens<C, A>
where
    C: CameraDevice + Clone,
    A: CaptureApi + Clone,
{
    pub fn new(
        camera: C,
        api: A,
        controller_config: ControllerConfig,
        kiosk_config: KioskConfig,
    ) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            camera,
            api,
            controller_config,
            kiosk_config,
            current: Mutex::new(Screen::None),
            signals,
        }
    }

    pub fn signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Screen<C, A>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enrollment(&self) -> Result<CaptureController<C, A>, ScreenError> {
        match &*self.lock() {
            Screen::Enrollment { controller, .. } => Ok(controller.clone()),
            _ => Err(ScreenError::NoEnrollment),
        }
    }

    fn kiosk(&self) -> Result<RecognitionLoop<C, A>, ScreenError> {
        match &*self.lock() {
            Screen::Kiosk { kiosk, .. } => Ok(kiosk.clone()),
            _ => Err(ScreenError::NoKiosk),
        }
    }

    /// Replace the open screen, tearing the old one down.
    async fn replace(&self, next: Screen<C, A>) {
        let previous = std::mem::replace(&mut *self.lock(), next);
        match previous {
            Screen::None => {}
            Screen::Enrollment {
                controller,
                forwarder,
            } => {
                controller.stop().await;
                forwarder.abort();
                tracing::debug!(employee_id = %controller.target().employee_id, "enrollment screen closed");
            }
            Screen::Kiosk { kiosk, forwarder } => {
                kiosk.stop().await;
                forwarder.abort();
                tracing::debug!("kiosk screen closed");
            }
        }
    }

    /// Open an enrollment (or update) screen for `employee_id`. The camera
    /// is not started until [`start`](Self::start).
    pub async fn open_enrollment(&self, employee_id: &str, update: bool) -> Result<String, ScreenError> {
        let target = SubmitTarget {
            employee_id: employee_id.to_string(),
            kind: if update {
                SubmitKind::Update
            } else {
                SubmitKind::Enroll
            },
        };
        let controller = CaptureController::new(
            self.camera.clone(),
            self.api.clone(),
            target,
            self.controller_config.clone(),
        );
        let forwarder = forward_enrollment(&controller, self.signals.clone());
        let view = serde_json::to_string(&controller.view())?;

        self.replace(Screen::Enrollment {
            controller,
            forwarder,
        })
        .await;
        tracing::info!(employee_id, update, "enrollment screen opened");
        Ok(view)
    }

    /// Open the kiosk and start recognizing.
    pub async fn open_kiosk(&self) {
        let kiosk = RecognitionLoop::new(
            self.camera.clone(),
            self.api.clone(),
            self.kiosk_config.clone(),
        );
        let forwarder = forward_kiosk(&kiosk, self.signals.clone());
        self.replace(Screen::Kiosk {
            kiosk: kiosk.clone(),
            forwarder,
        })
        .await;
        kiosk.start().await;
    }

    pub async fn stop_kiosk(&self) -> Result<(), ScreenError> {
        self.kiosk()?;
        self.replace(Screen::None).await;
        Ok(())
    }

    pub async fn close(&self) {
        self.replace(Screen::None).await;
    }

    pub async fn start(&self) -> Result<(), ScreenError> {
        self.enrollment()?.start().await;
        Ok(())
    }

    pub async fn capture(&self) -> Result<bool, ScreenError> {
        Ok(self.enrollment()?.capture().await)
    }

    pub async fn retake(&self) -> Result<(), ScreenError> {
        self.enrollment()?.retake().await;
        Ok(())
    }

    pub async fn save(&self) -> Result<Option<SubmitOutcome>, ScreenError> {
        Ok(self.enrollment()?.save().await)
    }

    pub async fn stop(&self) -> Result<(), ScreenError> {
        self.enrollment()?.stop().await;
        Ok(())
    }

    pub fn status(&self) -> Result<String, ScreenError> {
        let version = env!("CARGO_PKG_VERSION");
        let json = match &*self.lock() {
            Screen::None => serde_json::to_string(&Status::<()>::None { version })?,
            Screen::Enrollment { controller, .. } => {
                let target = controller.target();
                serde_json::to_string(&Status::Enrollment {
                    version,
                    employee_id: target.employee_id.clone(),
                    update: target.kind == SubmitKind::Update,
                    view: controller.view(),
                })?
            }
            Screen::Kiosk { kiosk, .. } => serde_json::to_string(&Status::<()>::Kiosk {
                version,
                running: kiosk.is_running(),
            })?,
        };
        Ok(json)
    }
}

fn publish<T: Serialize>(signals: &broadcast::Sender<Signal>, value: &T, wrap: fn(String) -> Signal) {
    match serde_json::to_string(value) {
        Ok(json) => {
            let _ = signals.send(wrap(json));
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize notification"),
    }
}

fn forward_enrollment<C: CameraDevice, A: CaptureApi>(
    controller: &CaptureController<C, A>,
    signals: broadcast::Sender<Signal>,
) -> JoinHandle<()> {
    let mut views = controller.watch();
    let mut events = controller.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let view = views.borrow_and_update().clone();
                    publish(&signals, &view, Signal::StateChanged);
                }
                event = events.recv() => match event {
                    Ok(event) => publish(&signals, &event, Signal::Event),
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "capture events lagged"),
                    Err(RecvError::Closed) => return,
                },
            }
        }
    })
}

fn forward_kiosk<C: CameraDevice, A: CaptureApi>(
    kiosk: &RecognitionLoop<C, A>,
    signals: broadcast::Sender<Signal>,
) -> JoinHandle<()> {
    let mut events = kiosk.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => publish(&signals, &event, Signal::Event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "kiosk events lagged"),
                Err(RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{FakeApi, FakeCamera};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    type TestScreens = Screens<Arc<FakeCamera>, Arc<FakeApi>>;

    fn screens() -> (TestScreens, Arc<FakeCamera>) {
        let camera = Arc::new(FakeCamera::default());
        let api = Arc::new(FakeApi::default());
        let controller_config = ControllerConfig {
            poll_interval: Duration::from_secs(3600),
            ..ControllerConfig::default()
        };
        let kiosk_config = KioskConfig {
            poll_interval: Duration::from_secs(3600),
            ..KioskConfig::default()
        };
        (
            Screens::new(Arc::clone(&camera), api, controller_config, kiosk_config),
            camera,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_need_an_enrollment_screen() {
        let (screens, _) = screens();
        assert!(matches!(screens.start().await, Err(ScreenError::NoEnrollment)));
        assert!(matches!(screens.save().await, Err(ScreenError::NoEnrollment)));
        assert!(matches!(screens.stop_kiosk().await, Err(ScreenError::NoKiosk)));

        let status: serde_json::Value = serde_json::from_str(&screens.status().unwrap()).unwrap();
        assert_eq!(status["screen"], "none");
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrollment_status_and_signals() {
        let (screens, camera) = screens();
        let mut signals = screens.signals();

        let view: serde_json::Value =
            serde_json::from_str(&screens.open_enrollment("E042", true).await.unwrap()).unwrap();
        assert_eq!(view["phase"], "idle");

        screens.start().await.unwrap();
        assert_eq!(camera.live.load(Ordering::SeqCst), 1);

        let status: serde_json::Value = serde_json::from_str(&screens.status().unwrap()).unwrap();
        assert_eq!(status["screen"], "enrollment");
        assert_eq!(status["employee_id"], "E042");
        assert_eq!(status["update"], true);
        assert_eq!(status["view"]["phase"], "live");

        let mut saw_state = false;
        let mut saw_event = false;
        while !(saw_state && saw_event) {
            match signals.recv().await.unwrap() {
                Signal::StateChanged(json) => saw_state |= json.contains("\"phase\""),
                Signal::Event(json) => saw_event |= json.contains("\"camera_active\""),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opening_kiosk_closes_enrollment() {
        let (screens, camera) = screens();
        screens.open_enrollment("E042", false).await.unwrap();
        screens.start().await.unwrap();

        screens.open_kiosk().await;
        assert_eq!(camera.live.load(Ordering::SeqCst), 1);
        assert_eq!(camera.max_live.load(Ordering::SeqCst), 1);
        assert!(matches!(screens.capture().await, Err(ScreenError::NoEnrollment)));

        let status: serde_json::Value = serde_json::from_str(&screens.status().unwrap()).unwrap();
        assert_eq!(status["screen"], "kiosk");
        assert_eq!(status["running"], true);

        screens.stop_kiosk().await.unwrap();
        assert_eq!(camera.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_camera() {
        let (screens, camera) = screens();
        screens.open_enrollment("E042", false).await.unwrap();
        screens.start().await.unwrap();
        screens.close().await;
        assert_eq!(camera.live.load(Ordering::SeqCst), 0);
        assert!(matches!(screens.stop().await, Err(ScreenError::NoEnrollment)));
    }
}
