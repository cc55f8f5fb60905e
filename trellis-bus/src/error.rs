/// Erreurs de la couche contrat.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("parasite target rejected: {0}")]
    ParasiteTarget(String),
}
