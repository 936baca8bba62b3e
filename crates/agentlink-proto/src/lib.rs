mod codec;
mod message;
mod pem;
mod wire;

pub use codec::{
    decode_frame, decode_frame_with_limit, decode_request, decode_response, encode_frame,
    encode_request, encode_request_frame, encode_response, encode_response_frame, read_request,
    read_response, write_request, write_response, MAX_FRAME_LEN,
};
pub use message::{
    AgentIdentity, AgentRequest, AgentResponse, MessageType, SSH_AGENT_RSA_SHA2_256,
    SSH_AGENT_RSA_SHA2_512,
};
pub use pem::{parse_identity, Identity};

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("trailing bytes after message {0}")]
    TrailingBytes(u8),
    #[error("bad response: {0}")]
    BadResponse(&'static str),
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}
