#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("consumer is stopped")]
    Stopped,
}
