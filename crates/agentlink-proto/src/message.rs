use crate::pem::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Failure = 5,
    Success = 6,
    RequestIdentities = 11,
    IdentitiesAnswer = 12,
    SignRequest = 13,
    SignResponse = 14,
    AddIdentity = 17,
}

/// RSA signature flags (RFC 8332).
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// A public key held by the agent, as reported in an identities answer.
/// `key_blob` is the SSH wire-format public key, reusable in sign requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    RequestIdentities,
    SignRequest {
        key_blob: Vec<u8>,
        data: Vec<u8>,
        flags: u32,
    },
    AddIdentity {
        identity: Identity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Failure,
    Success,
    IdentitiesAnswer {
        identities: Vec<AgentIdentity>,
    },
    SignResponse {
        signature_blob: Vec<u8>,
    },
    /// A defined or unknown message number outside the core set. The body is
    /// not parsed.
    NotYetSupported {
        message_number: u8,
    },
}
