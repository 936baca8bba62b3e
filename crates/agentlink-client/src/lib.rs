mod channel;
mod client;
mod transport;

pub use channel::Transaction;
pub use client::AgentClient;
pub use transport::{connect, default_socket_path, Connection};

use agentlink_proto::ProtoError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent not available: {0}")]
    AgentNotAvailable(String),
    #[error("operation in progress")]
    OperationInProgress,
    #[error("agent reported failure")]
    Refused,
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
