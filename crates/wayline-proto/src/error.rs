use thiserror::Error;

/// A well-formed message whose content cannot be acted on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("mission has no waypoints")]
    NoWaypoints,

    #[error("capacity exceeded: {count} waypoints, at most {max} allowed")]
    Capacity { count: usize, max: usize },

    #[error("waypoint {index} is missing {field}")]
    MissingField { index: usize, field: &'static str },

    #[error("waypoint {index} has invalid {field}: {value}")]
    OutOfRange { index: usize, field: &'static str, value: f64 },

    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("message too large: {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Problems with the byte stream itself, below the message layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line exceeded {max} bytes without terminator, dropped {dropped} bytes")]
    Oversized { dropped: usize, max: usize },

    #[error("line is not valid utf-8 ({len} bytes)")]
    InvalidUtf8 { len: usize },
}
