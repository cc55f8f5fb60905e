/// Erreurs d'orchestration. Les échecs build/start/stop remontent de façon
/// synchrone à l'appelant du cycle de vie, avec un code machine-readable
/// pour la surface REST.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid instance config: {0}")]
    InvalidConfig(String),
    #[error("image build failed for connector '{connector}': {detail}")]
    BuildFailure { connector: String, detail: String },
    #[error("container start failed for unit '{unit}': {detail}")]
    StartFailure { unit: String, detail: String },
    #[error("container runtime error: {0}")]
    Runtime(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HubError {
    /// Code stable exposé par l'API (`error.code`).
    pub fn code(&self) -> &'static str {
        match self {
            HubError::NotFound(_) => "not_found",
            HubError::AlreadyExists(_) => "already_exists",
            HubError::InvalidConfig(_) => "invalid_config",
            HubError::BuildFailure { .. } => "build_failure",
            HubError::StartFailure { .. } => "start_failure",
            HubError::Runtime(_) => "runtime_error",
            HubError::Timeout(_) => "timeout",
            HubError::Io(_) => "io_error",
            HubError::Json(_) | HubError::Yaml(_) => "serialization_error",
        }
    }
}
