use glam::UVec3;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no suitable gpu adapter available")]
    NoAdapter,

    #[error("failed to acquire gpu device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("render called before the pipeline was initialized")]
    NotInitialized,

    #[error("gpu allocation of {what} ({size} bytes) exceeds device limits")]
    ResourceExhausted { what: &'static str, size: u64 },

    #[error("{name} has format {actual:?}, expected {expected:?}")]
    InvalidFormat {
        name: &'static str,
        expected: wgpu::TextureFormat,
        actual: wgpu::TextureFormat,
    },

    #[error("invalid cluster grid {dim}: dimensions must be non-zero and their product at most {max}")]
    InvalidGrid { dim: UVec3, max: u32 },

    #[error("compute kernel {name} failed to build: {reason}")]
    KernelLoadFailed { name: &'static str, reason: String },

    #[error("{name} is {actual_width}x{actual_height} but the pipeline viewport is {width}x{height}")]
    ViewportMismatch {
        name: &'static str,
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("kernel {kernel}, binding {slot}: {reason}")]
    Configuration {
        kernel: &'static str,
        slot: u32,
        reason: String,
    },

    #[error("light index {index} is out of range (store holds {len} slots)")]
    IndexOutOfRange { index: u32, len: u32 },

    #[error("failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}
