use crate::controller::ControllerConfig;
use crate::kiosk::KioskConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server paths for each request the daemon makes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub detect: String,
    pub enroll: String,
    pub update: String,
    pub recognize: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            detect: "/enroll/detect_face".into(),
            enroll: "/enroll/capture".into(),
            update: "/enroll/update_capture".into(),
            recognize: "/kiosk/recognize".into(),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `FACEGATE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the attendance server.
    pub server_url: String,
    /// Anti-forgery token sent with every POST.
    pub csrf_token: Option<String>,
    /// Raw `Cookie` header value carrying the logged-in session.
    pub session_cookie: Option<String>,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    pub enroll_poll_ms: u64,
    pub kiosk_poll_ms: u64,
    /// Continuous all-clear time required before capture is enabled.
    pub dwell_ms: u64,
    /// Delay between the capture trigger and the frame grab; 0 disables.
    pub settle_ms: u64,
    /// Upper bound on a single detection request.
    pub detect_timeout_ms: u64,
    /// Upper bound on any HTTP request.
    pub request_timeout_ms: u64,
    pub enroll_jpeg_quality: u8,
    pub kiosk_jpeg_quality: u8,
    /// Quiet period after a kiosk match before frames are sent again.
    pub kiosk_debounce_ms: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            csrf_token: None,
            session_cookie: None,
            camera_device: "/dev/video0".into(),
            warmup_frames: 2,
            enroll_poll_ms: 600,
            kiosk_poll_ms: 650,
            dwell_ms: 800,
            settle_ms: 300,
            detect_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
            enroll_jpeg_quality: 92,
            kiosk_jpeg_quality: 70,
            kiosk_debounce_ms: 500,
            system_bus: false,
            endpoints: Endpoints::default(),
        }
    }
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (or the XDG default path, if present),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = if path.exists() {
            tracing::info!(path = %path.display(), "loading config file");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `FACEGATE_*` overrides read through `lookup`. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEGATE_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("FACEGATE_CSRF_TOKEN") {
            self.csrf_token = Some(v);
        }
        if let Some(v) = lookup("FACEGATE_SESSION_COOKIE") {
            self.session_cookie = Some(v);
        }
        if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEGATE_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
        override_parsed(&lookup, "FACEGATE_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "FACEGATE_ENROLL_POLL_MS", &mut self.enroll_poll_ms);
        override_parsed(&lookup, "FACEGATE_KIOSK_POLL_MS", &mut self.kiosk_poll_ms);
        override_parsed(&lookup, "FACEGATE_DWELL_MS", &mut self.dwell_ms);
        override_parsed(&lookup, "FACEGATE_SETTLE_MS", &mut self.settle_ms);
        override_parsed(&lookup, "FACEGATE_DETECT_TIMEOUT_MS", &mut self.detect_timeout_ms);
        override_parsed(&lookup, "FACEGATE_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_parsed(&lookup, "FACEGATE_ENROLL_JPEG_QUALITY", &mut self.enroll_jpeg_quality);
        override_parsed(&lookup, "FACEGATE_KIOSK_JPEG_QUALITY", &mut self.kiosk_jpeg_quality);
        override_parsed(&lookup, "FACEGATE_KIOSK_DEBOUNCE_MS", &mut self.kiosk_debounce_ms);
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_millis(self.enroll_poll_ms.max(1)),
            dwell: Duration::from_millis(self.dwell_ms),
            settle_delay: Duration::from_millis(self.settle_ms),
            detect_timeout: Duration::from_millis(self.detect_timeout_ms),
            jpeg_quality: self.enroll_jpeg_quality,
        }
    }

    pub fn kiosk_config(&self) -> KioskConfig {
        KioskConfig {
            poll_interval: Duration::from_millis(self.kiosk_poll_ms.max(1)),
            debounce: Duration::from_millis(self.kiosk_debounce_ms),
            request_timeout: Duration::from_millis(self.detect_timeout_ms),
            jpeg_quality: self.kiosk_jpeg_quality,
        }
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facegate")
        .join("config.toml")
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
