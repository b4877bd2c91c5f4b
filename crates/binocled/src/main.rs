use anyhow::{Context, Result};
use binocle_hw::sim::SimLayout;
use binocle_hw::{CameraBackend, Illuminator, SimBackend, SimSensorSpec, V4lBackend};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.freedesktop.Binocle1";
const OBJECT_PATH: &str = "/org/freedesktop/Binocle1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("binocled starting");
    let config = config::Config::from_env();

    let backend: Arc<dyn CameraBackend> = if config.simulate {
        tracing::info!("using simulated cameras");
        Arc::new(simulated_backend(&config))
    } else {
        Arc::new(V4lBackend)
    };

    let illuminator = illuminator(&config);

    let engine = engine::spawn_engine(backend, &config, illuminator)
        .await
        .context("failed to start capture engine")?;

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::BinocleService::new(engine.clone()))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, output = %config.output_dir.display(), "binocled ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("binocled shutting down");
    if let Err(e) = engine.shutdown().await {
        tracing::warn!(error = %e, "engine shutdown failed");
    }

    Ok(())
}

/// Illumination is only meaningful with a secondary sensor.
fn illuminator(config: &config::Config) -> Option<Illuminator> {
    if !config.illumination_enabled || config.secondary_device.is_none() {
        tracing::info!("IR illumination disabled");
        return None;
    }
    match Illuminator::for_profile(&config.illumination_profile) {
        Ok(ir) => {
            tracing::info!(profile = %ir.name(), control = %ir.control_path(), "IR illumination found");
            Some(ir)
        }
        Err(e) => {
            tracing::warn!(error = %e, "proceeding without IR illumination");
            None
        }
    }
}

fn simulated_backend(config: &config::Config) -> SimBackend {
    let (pw, ph) = config.primary_size.unwrap_or((640, 480));
    let mut sim = SimBackend::new()
        .with_sensor(SimSensorSpec::new(&config.primary_device, pw, ph).auto_fps(30));
    if let Some(id) = &config.secondary_device {
        let (sw, sh) = config.secondary_size.unwrap_or((480, 640));
        sim = sim.with_sensor(
            SimSensorSpec::new(id, sw, sh)
                .layout(SimLayout::I420)
                .auto_fps(30),
        );
    }
    sim
}
