use anyhow::{Context, Result};
use binocle_core::{save_corrected_luma, CoordinatorConfig, DualSensorCoordinator, FrameStatsAnalyzer};
use binocle_hw::{CameraBackend, Illuminator, SimBackend, SimSensorSpec, V4lBackend};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// D-Bus proxy for the daemon; `#[zbus::proxy]` generates `BinocleProxy`.
#[zbus::proxy(
    interface = "org.freedesktop.Binocle1",
    default_service = "org.freedesktop.Binocle1",
    default_path = "/org/freedesktop/Binocle1"
)]
trait Binocle {
    async fn take_photo(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "binocle", about = "Binocle dual-camera capture CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Run the pairing pipeline and one still capture directly (bypasses the daemon)
    Test {
        /// Primary (visible) sensor
        #[arg(long, default_value = "/dev/video0")]
        primary: String,
        /// Secondary (IR) sensor; omit for single-sensor mode
        #[arg(long)]
        secondary: Option<String>,
        /// Analyzed pairs to wait for before the still capture
        #[arg(long, default_value_t = 10)]
        pairs: usize,
        /// Directory for the captured stills
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Illumination profile to switch with the secondary sensor
        #[arg(long)]
        illumination: Option<String>,
        /// Use simulated cameras
        #[arg(long)]
        simulate: bool,
    },
    /// Ask the daemon for a still capture
    Capture,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = V4lBackend::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                let sizes = V4lBackend.output_sizes(&d.path);
                let sizes: Vec<String> = sizes.iter().map(|(w, h)| format!("{w}x{h}")).collect();
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
                if !sizes.is_empty() {
                    println!("    4:2:0 sizes: {}", sizes.join(" "));
                }
            }
        }
        Commands::Test {
            primary,
            secondary,
            pairs,
            output,
            illumination,
            simulate,
        } => {
            run_test(primary, secondary, pairs, output, illumination, simulate).await?;
        }
        Commands::Capture => {
            let proxy = connect(cli.session_bus).await?;
            let report = proxy.take_photo().await.context("TakePhoto failed")?;
            print_json(&report);
        }
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            let status = proxy.status().await.context("Status failed")?;
            print_json(&status);
        }
    }

    Ok(())
}

async fn connect(session_bus: bool) -> Result<BinocleProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    BinocleProxy::new(&conn)
        .await
        .context("binocled not reachable")
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| raw.to_string())),
        Err(_) => println!("{raw}"),
    }
}

async fn run_test(
    primary: String,
    secondary: Option<String>,
    pairs: usize,
    output: PathBuf,
    illumination: Option<String>,
    simulate: bool,
) -> Result<()> {
    let backend: Arc<dyn CameraBackend> = if simulate {
        let mut sim = SimBackend::new().with_sensor(SimSensorSpec::new(&primary, 640, 480).auto_fps(30));
        if let Some(id) = &secondary {
            sim = sim.with_sensor(SimSensorSpec::new(id, 480, 640).auto_fps(30));
        }
        Arc::new(sim)
    } else {
        Arc::new(V4lBackend)
    };

    let illuminator = illumination
        .map(|name| Illuminator::for_profile(&name))
        .transpose()?;

    let config = CoordinatorConfig {
        primary_id: primary,
        secondary_id: secondary,
        ..CoordinatorConfig::default()
    };
    println!(
        "Opening {}{}...",
        config.primary_id,
        config
            .secondary_id
            .as_deref()
            .map(|s| format!(" + {s}"))
            .unwrap_or_default()
    );
    let mut coordinator = DualSensorCoordinator::open(backend, &config, illuminator, None).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    coordinator.start_analysis(FrameStatsAnalyzer::default(), move |outcome| {
        let _ = tx.send(outcome);
    })?;

    for _ in 0..pairs {
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .context("no frame pair within 5s")?
            .context("pairing stopped")?;
        match outcome.result {
            Ok(stats) => {
                let line: Vec<String> = stats
                    .iter()
                    .map(|s| {
                        format!(
                            "{:?} #{} {}x{} brightness={:.1}{}",
                            s.role,
                            s.sequence,
                            s.width,
                            s.height,
                            s.brightness,
                            if s.dark { " DARK" } else { "" }
                        )
                    })
                    .collect();
                println!("  {}", line.join(" | "));
            }
            Err(e) => println!("  analysis failed: {e}"),
        }
    }

    println!("Taking still capture...");
    let capture = coordinator.take_photo().await;
    let status = coordinator.status();
    match capture {
        Ok(result) => {
            let (primary, secondary, metadata) = result.into_frames();
            println!(
                "  metadata: sensor={} sequence={} timestamp={}ns",
                metadata.sensor_id, metadata.sequence, metadata.sensor_timestamp_ns
            );
            let path = save_corrected_luma(&primary, &output, "primary")?;
            println!("  saved {}", path.display());
            if let Some(frame) = secondary {
                let path = save_corrected_luma(&frame, &output, "secondary")?;
                println!("  saved {}", path.display());
            }
        }
        Err(e) => {
            println!("  still capture failed: {e} (retryable: {})", e.is_retryable());
        }
    }

    coordinator.close().await;
    println!(
        "Analysis frames: primary {} (dropped {})",
        status.primary.analysis_frames, status.primary.analysis_dropped
    );
    if let Some(s) = status.secondary {
        println!(
            "Analysis frames: secondary {} (dropped {})",
            s.analysis_frames, s.analysis_dropped
        );
    }
    Ok(())
}
