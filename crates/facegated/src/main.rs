use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod camera;
mod config;
mod controller;
mod dbus_interface;
mod kiosk;
mod screens;

use dbus_interface::{FacegateService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        server = %config.server_url,
        camera = %config.camera_device,
        system_bus = config.system_bus,
        "configuration loaded"
    );

    let api = Arc::new(api::HttpApi::new(&config).context("failed to build HTTP client")?);
    let camera = Arc::new(camera::V4lCamera::new(
        config.camera_device.clone(),
        config.warmup_frames,
    ));
    let screens = Arc::new(screens::Screens::new(
        camera,
        api,
        config.controller_config(),
        config.kiosk_config(),
    ));

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FacegateService::new(Arc::clone(&screens)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    let relay = dbus_interface::spawn_signal_relay(&conn, &screens)?;

    tracing::info!(bus_name = BUS_NAME, "facegated ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    screens.close().await;
    relay.abort();

    Ok(())
}
