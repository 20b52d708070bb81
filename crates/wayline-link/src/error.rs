use thiserror::Error;
use wayline_proto::ProtoError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("enumerate ports: {0}")]
    Enumerate(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("connection manager stopped")]
    Closed,
}
