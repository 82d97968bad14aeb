use crate::api::HttpApi;
use crate::camera::V4lCamera;
use crate::screens::{ScreenError, Screens, Signal};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use zbus::object_server::SignalEmitter;
use zbus::{interface, Connection};

pub const BUS_NAME: &str = "org.freedesktop.Facegate1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Facegate1";

pub type DaemonScreens = Screens<Arc<V4lCamera>, Arc<HttpApi>>;

impl From<ScreenError> for zbus::fdo::Error {
    fn from(e: ScreenError) -> Self {
        zbus::fdo::Error::Failed(e.to_string())
    }
}

/// D-Bus interface for the Facegate capture daemon.
///
/// Bus name: org.freedesktop.Facegate1
/// Object path: /org/freedesktop/Facegate1
pub struct FacegateService {
    screens: Arc<DaemonScreens>,
}

impl FacegateService {
    pub fn new(screens: Arc<DaemonScreens>) -> Self {
        Self { screens }
    }
}

#[interface(name = "org.freedesktop.Facegate1")]
impl FacegateService {
    /// Open the capture screen for an employee. Returns the initial state.
    async fn open_enrollment(&self, employee_id: &str, update: bool) -> zbus::fdo::Result<String> {
        if employee_id.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("employee_id is empty".into()));
        }
        Ok(self.screens.open_enrollment(employee_id, update).await?)
    }

    /// Close whichever screen is open and release the camera.
    async fn close(&self) {
        self.screens.close().await;
    }

    async fn start(&self) -> zbus::fdo::Result<()> {
        Ok(self.screens.start().await?)
    }

    /// Returns whether a frame is now held for preview.
    async fn capture(&self) -> zbus::fdo::Result<bool> {
        Ok(self.screens.capture().await?)
    }

    async fn retake(&self) -> zbus::fdo::Result<()> {
        Ok(self.screens.retake().await?)
    }

    /// Submit the held frame. Returns the outcome as JSON, or `null` when
    /// the call was a no-op.
    async fn save(&self) -> zbus::fdo::Result<String> {
        let outcome = self.screens.save().await?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn stop(&self) -> zbus::fdo::Result<()> {
        Ok(self.screens.stop().await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.screens.status()?)
    }

    async fn start_kiosk(&self) {
        self.screens.open_kiosk().await;
    }

    async fn stop_kiosk(&self) -> zbus::fdo::Result<()> {
        Ok(self.screens.stop_kiosk().await?)
    }

    #[zbus(signal)]
    async fn state_changed(emitter: &SignalEmitter<'_>, view: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn event(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}

/// Relay screen notifications as D-Bus signals on [`OBJECT_PATH`].
pub fn spawn_signal_relay(conn: &Connection, screens: &DaemonScreens) -> zbus::Result<JoinHandle<()>> {
    let emitter = SignalEmitter::new(conn, OBJECT_PATH)?.into_owned();
    let mut signals = screens.signals();

    Ok(tokio::spawn(async move {
        loop {
            let sent = match signals.recv().await {
                Ok(Signal::StateChanged(json)) => FacegateService::state_changed(&emitter, &json).await,
                Ok(Signal::Event(json)) => FacegateService::event(&emitter, &json).await,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "signal relay lagged");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if let Err(e) = sent {
                tracing::warn!(error = %e, "failed to emit signal");
            }
        }
    }))
}
