use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

const WATCH_INTERVAL: Duration = Duration::from_millis(250);

// `#[zbus::proxy]` generates `FacegateProxy` (async) and `FacegateProxyBlocking`.
#[zbus::proxy(
    interface = "org.freedesktop.Facegate1",
    default_service = "org.freedesktop.Facegate1",
    default_path = "/org/freedesktop/Facegate1"
)]
trait Facegate {
    async fn open_enrollment(&self, employee_id: &str, update: bool) -> zbus::Result<String>;
    async fn close(&self) -> zbus::Result<()>;
    async fn start(&self) -> zbus::Result<()>;
    async fn capture(&self) -> zbus::Result<bool>;
    async fn retake(&self) -> zbus::Result<()>;
    async fn save(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn start_kiosk(&self) -> zbus::Result<()>;
    async fn stop_kiosk(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face capture CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the capture screen for an employee and start the camera
    Enroll {
        /// Employee identifier
        employee_id: String,
        /// Replace an existing enrollment
        #[arg(long)]
        update: bool,
        /// Capture and save as soon as the quality gate allows
        #[arg(long)]
        auto: bool,
    },
    /// Take the still on the open capture screen
    Capture,
    /// Discard the still and restart the camera
    Retake,
    /// Submit the still
    Save,
    /// Turn the camera off on the open capture screen
    Stop,
    /// Close the open screen
    Close,
    /// Show daemon status
    Status,
    /// Kiosk recognition
    Kiosk {
        #[command(subcommand)]
        action: KioskAction,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Camera device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Write the captured frame as JPEG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum KioskAction {
    Start,
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Test { device, output } => camera_test(&device, output),
        command => {
            tracing::debug!(system_bus = cli.system, "connecting to facegated");
            let conn = match cli.system {
                true => zbus::Connection::system().await,
                false => zbus::Connection::session().await,
            }
            .context("failed to connect to D-Bus")?;
            let proxy = FacegateProxy::new(&conn)
                .await
                .context("facegated is not reachable")?;
            run(&proxy, command).await
        }
    }
}

async fn run(proxy: &FacegateProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Enroll {
            employee_id,
            update,
            auto,
        } => enroll(proxy, &employee_id, update, auto).await?,
        Commands::Capture => {
            if proxy.capture().await? {
                println!("Frame captured. Run `facegate save` or `facegate retake`.");
            } else {
                println!("Capture not allowed yet.");
            }
        }
        Commands::Retake => proxy.retake().await?,
        Commands::Save => print_outcome(&proxy.save().await?)?,
        Commands::Stop => proxy.stop().await?,
        Commands::Close => proxy.close().await?,
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Kiosk { action } => match action {
            KioskAction::Start => {
                proxy.start_kiosk().await?;
                println!("Kiosk started");
            }
            KioskAction::Stop => {
                proxy.stop_kiosk().await?;
                println!("Kiosk stopped");
            }
        },
        // Handled in main without a bus connection
        Commands::Devices | Commands::Test { .. } => {}
    }
    Ok(())
}

/// Open the screen, start the camera and follow guidance until the screen
/// finishes or Ctrl-C.
async fn enroll(proxy: &FacegateProxy<'_>, employee_id: &str, update: bool, auto: bool) -> Result<()> {
    proxy.open_enrollment(employee_id, update).await?;
    proxy.start().await?;

    let mut last_message = String::new();
    loop {
        let status: Value = serde_json::from_str(&proxy.status().await?)?;
        if status["screen"] != "enrollment" {
            bail!("enrollment screen was closed");
        }
        let view = &status["view"];

        let line = describe(view);
        if line != last_message {
            println!("{line}");
            last_message = line;
        }

        match view["phase"].as_str() {
            Some("done") => return Ok(()),
            Some("idle") => bail!("camera stopped"),
            _ => {}
        }

        if auto {
            if view["allow_capture"].as_bool().unwrap_or(false) {
                proxy.capture().await?;
            } else if view["can_save"].as_bool().unwrap_or(false) {
                let outcome = proxy.save().await?;
                print_outcome(&outcome)?;
                if !outcome_accepted(&outcome) {
                    proxy.retake().await?;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => {
                proxy.stop().await?;
                return Ok(());
            }
        }
    }
}

/// One status line for a capture view.
fn describe(view: &Value) -> String {
    let phase = view["phase"].as_str().unwrap_or("?");
    let message = view["message"].as_str().unwrap_or("");
    match view["allow_capture"].as_bool() {
        Some(true) => format!("[{phase}] {message} (capture enabled)"),
        _ => format!("[{phase}] {message}"),
    }
}

fn outcome_accepted(outcome: &str) -> bool {
    serde_json::from_str::<Value>(outcome)
        .map(|v| v["kind"] == "accepted")
        .unwrap_or(false)
}

fn print_outcome(outcome: &str) -> Result<()> {
    let value: Value = serde_json::from_str(outcome)?;
    match value["message"].as_str() {
        Some(message) => println!("{message}"),
        None => println!("Nothing to save."),
    }
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = facegate_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str, output: Option<PathBuf>) -> Result<()> {
    println!("Opening {device}...");
    let camera = facegate_hw::Camera::open(device)?;
    println!(
        "Format: {:?} {}x{}",
        camera.pixel_format(),
        camera.width,
        camera.height
    );

    let frame = camera.capture_frame()?;
    println!(
        "Captured frame #{} ({} bytes, {:?})",
        frame.sequence,
        frame.data.len(),
        frame.layout
    );

    if let Some(path) = output {
        let jpeg = frame.encode_jpeg(92)?;
        std::fs::write(&path, jpeg).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe() {
        let view = json!({"phase": "live", "message": "Hold still… 50%", "allow_capture": false});
        assert_eq!(describe(&view), "[live] Hold still… 50%");

        let view = json!({"phase": "live", "message": "Face detected – ready to capture", "allow_capture": true});
        assert_eq!(describe(&view), "[live] Face detected – ready to capture (capture enabled)");
    }

    #[test]
    fn test_outcome_accepted() {
        assert!(outcome_accepted(r#"{"kind": "accepted", "message": "ok"}"#));
        assert!(!outcome_accepted(r#"{"kind": "rejected", "reason": "duplicate", "message": "x"}"#));
        assert!(!outcome_accepted("null"));
    }
}
