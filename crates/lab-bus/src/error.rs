use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BusError>;
