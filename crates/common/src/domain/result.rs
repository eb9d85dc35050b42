use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Malformed message on topic {0}: {1}")]
    MalformedMessage(String, String),

    #[error("Message on topic {0} missing entity_id")]
    MissingEntityId(String),

    #[error("Unrecognized topic: {0}")]
    UnknownTopic(String),

    #[error("Invalid audio signal: {0}")]
    InvalidAudioSignal(String),

    #[error("Payload decode error: {0}")]
    PayloadDecode(String),

    #[error("Malformed bid: {0}")]
    MalformedBid(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Detection store error: {0}")]
    DetectionStoreError(String),

    #[error("Alert delivery error: {0}")]
    AlertDeliveryError(String),

    #[error("Bus publish error: {0}")]
    PublishError(#[from] anyhow::Error),
}
