use binocle_core::still::{CAPTURE_TIMEOUT, IMAGE_BUFFER_SIZE};
use binocle_core::{coordinator::SECONDARY_SIZE, CoordinatorConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Primary (visible) sensor device path (default: /dev/video0).
    pub primary_device: String,
    /// Secondary (IR) sensor device path; `none` runs single-sensor (default: /dev/video2).
    pub secondary_device: Option<String>,
    /// Upper bound on the primary output size, as `WxH`.
    pub primary_size: Option<(u32, u32)>,
    /// Requested secondary output size (default: 480x640).
    pub secondary_size: Option<(u32, u32)>,
    /// Frames each sink may hold at once.
    pub buffer_count: usize,
    /// Still-capture timeout in milliseconds.
    pub capture_timeout_ms: u64,
    /// Illumination profile switched with the secondary sensor.
    pub illumination_profile: String,
    /// Whether to drive IR illumination at all.
    pub illumination_enabled: bool,
    /// Where still captures are written.
    pub output_dir: PathBuf,
    /// Use the simulated camera backend instead of V4L2.
    pub simulate: bool,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `BINOCLE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("binocle");

        let secondary_device = std::env::var("BINOCLE_SECONDARY_DEVICE")
            .unwrap_or_else(|_| "/dev/video2".to_string());

        Self {
            primary_device: std::env::var("BINOCLE_PRIMARY_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            secondary_device: (!secondary_device.eq_ignore_ascii_case("none"))
                .then_some(secondary_device),
            primary_size: env_size("BINOCLE_PRIMARY_SIZE", None),
            secondary_size: env_size("BINOCLE_SECONDARY_SIZE", Some(SECONDARY_SIZE)),
            buffer_count: env_usize("BINOCLE_BUFFER_COUNT", IMAGE_BUFFER_SIZE),
            capture_timeout_ms: env_u64(
                "BINOCLE_CAPTURE_TIMEOUT_MS",
                CAPTURE_TIMEOUT.as_millis() as u64,
            ),
            illumination_profile: std::env::var("BINOCLE_ILLUMINATION_PROFILE")
                .unwrap_or_else(|_| "proc-led-light".to_string()),
            illumination_enabled: env_flag("BINOCLE_ILLUMINATION_ENABLED", true),
            output_dir: std::env::var("BINOCLE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("captures")),
            simulate: env_flag("BINOCLE_SIMULATE", false),
            session_bus: env_flag("BINOCLE_SESSION_BUS", false),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            primary_id: self.primary_device.clone(),
            secondary_id: self.secondary_device.clone(),
            primary_size: self.primary_size,
            secondary_size: self.secondary_size,
            buffer_count: self.buffer_count,
            capture_timeout: Duration::from_millis(self.capture_timeout_ms),
        }
    }
}

/// Parse `WxH` (e.g. `640x480`).
fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    let (w, h) = (w.parse().ok()?, h.parse().ok()?);
    (w > 0 && h > 0).then_some((w, h))
}

fn env_size(key: &str, default: Option<(u32, u32)>) -> Option<(u32, u32)> {
    match std::env::var(key) {
        Ok(v) if v.eq_ignore_ascii_case("auto") => None,
        Ok(v) => parse_size(&v).or_else(|| {
            tracing::warn!(key, value = %v, "ignoring malformed size");
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
