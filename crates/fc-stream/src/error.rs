#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("bson error: {0}")]
    Bson(String),
    #[error("checkpoint store unreachable: {0}")]
    CheckpointUnreachable(String),
    #[error("projection failed: {0}")]
    Projection(String),
    #[error("resume token expired")]
    StaleResumeToken,
    #[error("change stream closed unexpectedly")]
    StreamClosed,
}

pub type Result<T> = std::result::Result<T, StreamError>;
