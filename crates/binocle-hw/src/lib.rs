//! binocle-hw: hardware abstraction for dual-sensor capture.
//!
//! Provides sensor sessions over V4L2 (or a simulated backend), leased
//! frame buffers, output sinks, 4:2:0 pixel transforms, and IR
//! illumination control.

pub mod camera;
pub mod frame;
pub mod illumination;
pub mod pixel;
pub mod profiles;
pub mod sensor;
pub mod sim;
pub mod sink;

pub use camera::V4lBackend;
pub use frame::{BufferPool, Frame, PixelFormat, Plane};
pub use illumination::{IlluminationError, Illuminator};
pub use pixel::{rotate_and_mirror, to_packed_chroma, Nv21Image, TransformError};
pub use sensor::{
    CameraBackend, CaptureMetadata, DeviceErrorReason, DeviceOpenError, SensorConfig, SensorSession,
    SessionConfigError,
};
pub use sim::{SimBackend, SimControl, SimSensorSpec};
pub use sink::FrameSink;
