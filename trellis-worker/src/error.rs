use trellis_bus::BusError;

/// Worker-side failures. Device errors are localized: a single unreachable
/// device never takes the worker down or blocks its siblings.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("invalid worker config: {0}")]
    Config(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WorkerError {
    /// Stable machine-readable code for structured error messages.
    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::DeviceUnreachable(_) => "device_unreachable",
            WorkerError::Command(_) => "command_failed",
            WorkerError::Config(_) => "invalid_config",
            WorkerError::Bus(_) => "bus_error",
            WorkerError::Io(_) => "io_error",
            WorkerError::Json(_) | WorkerError::Yaml(_) => "serialization_error",
        }
    }
}
