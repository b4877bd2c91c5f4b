use crate::engine::{EngineError, EngineHandle};
use binocle_core::CaptureError;
use zbus::interface;

/// D-Bus interface for the Binocle capture daemon.
///
/// Bus name: org.freedesktop.Binocle1
/// Object path: /org/freedesktop/Binocle1
pub struct BinocleService {
    engine: EngineHandle,
}

impl BinocleService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.freedesktop.Binocle1")]
impl BinocleService {
    /// Take one still from each sensor. Returns a JSON report with the
    /// saved file paths and the capture metadata.
    async fn take_photo(&self) -> zbus::fdo::Result<String> {
        tracing::info!("take_photo requested");
        let report = self.engine.take_photo().await.map_err(to_fdo)?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "sensors": status.sensors,
            "analysis": status.analysis,
        })
        .to_string())
    }
}

/// Timeouts stay distinguishable so clients know a retry is reasonable.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match &err {
        EngineError::Capture(CaptureError::Timeout(_)) => zbus::fdo::Error::TimedOut(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}
