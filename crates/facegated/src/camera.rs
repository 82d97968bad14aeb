use facegate_hw::{Camera, CameraError, Frame};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Source of camera streams. One acquired stream is one camera session.
pub trait CameraDevice: Send + Sync + 'static {
    type Stream: VideoStream;

    /// Acquire exclusive access to the camera.
    fn acquire(&self) -> impl Future<Output = Result<Self::Stream, CameraError>> + Send;
}

/// Clone-safe handle to an acquired camera stream.
pub trait VideoStream: Clone + Send + Sync + 'static {
    /// Grab the current frame.
    fn grab(&self) -> impl Future<Output = Result<Frame, CameraError>> + Send;

    /// Stop the stream and give the device back. Grabs on any clone of a
    /// released handle fail with [`CameraError::Released`].
    fn release(&self) -> impl Future<Output = ()> + Send;
}

impl<T: CameraDevice> CameraDevice for Arc<T> {
    type Stream = T::Stream;

    fn acquire(&self) -> impl Future<Output = Result<Self::Stream, CameraError>> + Send {
        (**self).acquire()
    }
}

/// Messages sent from stream handles to the capture thread.
enum StreamRequest {
    Grab {
        reply: oneshot::Sender<Result<Frame, CameraError>>,
    },
    Release {
        reply: oneshot::Sender<()>,
    },
}

/// V4L2 camera; each acquired stream runs on its own capture thread.
pub struct V4lCamera {
    device_path: String,
    warmup_frames: usize,
}

impl V4lCamera {
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
        }
    }
}

/// Handle to a capture thread owning an open V4L2 device.
#[derive(Clone)]
pub struct V4lStream {
    tx: mpsc::Sender<StreamRequest>,
}

impl CameraDevice for V4lCamera {
    type Stream = V4lStream;

    /// Spawn the capture thread and open the device on it.
    ///
    /// Resolves once the device is open and warmup frames are discarded, or
    /// with the open error. The device never leaves its thread.
    async fn acquire(&self) -> Result<V4lStream, CameraError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CameraError>>();
        let (tx, mut rx) = mpsc::channel::<StreamRequest>(4);
        let device_path = self.device_path.clone();
        let warmup_frames = self.warmup_frames;

        std::thread::Builder::new()
            .name("facegate-camera".into())
            .spawn(move || {
                let camera = match Camera::open(&device_path) {
                    Ok(camera) => camera,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let mut preview = match camera.preview() {
                    Ok(preview) => preview,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                // Let exposure settle before the first frame anyone sees
                for _ in 0..warmup_frames {
                    let _ = preview.next_frame();
                }
                tracing::debug!(device = %device_path, warmup_frames, "camera stream ready");
                let _ = ready_tx.send(Ok(()));

                while let Some(req) = rx.blocking_recv() {
                    match req {
                        StreamRequest::Grab { reply } => {
                            let _ = reply.send(preview.next_frame());
                        }
                        StreamRequest::Release { reply } => {
                            drop(preview);
                            drop(camera);
                            tracing::debug!(device = %device_path, "camera released");
                            let _ = reply.send(());
                            return;
                        }
                    }
                }
                tracing::debug!(device = %device_path, "all stream handles dropped; closing camera");
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn camera thread: {e}")))?;

        ready_rx.await.map_err(|_| CameraError::Released)??;
        Ok(V4lStream { tx })
    }
}

impl VideoStream for V4lStream {
    async fn grab(&self) -> Result<Frame, CameraError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StreamRequest::Grab { reply: reply_tx })
            .await
            .map_err(|_| CameraError::Released)?;
        reply_rx.await.map_err(|_| CameraError::Released)?
    }

    async fn release(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(StreamRequest::Release { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_missing_device_fails() {
        let camera = V4lCamera::new("/dev/video-does-not-exist", 0);
        let err = camera.acquire().await.err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_released_stream_rejects_grabs() {
        // A stream whose thread has gone away behaves like a released one.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let stream = V4lStream { tx };
        assert!(matches!(stream.grab().await, Err(CameraError::Released)));
        stream.release().await;
    }
}
