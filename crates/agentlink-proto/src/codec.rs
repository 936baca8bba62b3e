use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::{AgentIdentity, AgentRequest, AgentResponse, MessageType};
use crate::pem::Identity;
use crate::wire::{self, Reader};
use crate::{ProtoError, Result};

pub const MAX_FRAME_LEN: usize = 256 * 1024;

pub fn encode_frame(payload: &[u8], out: &mut BytesMut) {
    out.reserve(4 + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
}

/// Splits the next complete frame off the front of `buf`. Returns `Ok(None)`
/// until the whole frame has been accumulated.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    decode_frame_with_limit(buf, MAX_FRAME_LEN)
}

pub fn decode_frame_with_limit(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_len {
        return Err(ProtoError::FrameTooLarge(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

pub fn encode_request(request: &AgentRequest, out: &mut BytesMut) {
    match request {
        AgentRequest::RequestIdentities => {
            out.put_u8(MessageType::RequestIdentities as u8);
        }
        AgentRequest::SignRequest {
            key_blob,
            data,
            flags,
        } => {
            out.put_u8(MessageType::SignRequest as u8);
            wire::put_string(out, key_blob);
            wire::put_string(out, data);
            out.put_u32(*flags);
        }
        AgentRequest::AddIdentity { identity } => {
            out.put_u8(MessageType::AddIdentity as u8);
            for field in &identity.fields {
                wire::put_string(out, field);
            }
        }
    }
}

pub fn encode_request_frame(request: &AgentRequest) -> Bytes {
    let mut payload = BytesMut::new();
    encode_request(request, &mut payload);
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.put_slice(&payload);
    framed.freeze()
}

pub fn encode_response(response: &AgentResponse, out: &mut BytesMut) {
    match response {
        AgentResponse::Failure => out.put_u8(MessageType::Failure as u8),
        AgentResponse::Success => out.put_u8(MessageType::Success as u8),
        AgentResponse::IdentitiesAnswer { identities } => {
            out.put_u8(MessageType::IdentitiesAnswer as u8);
            out.put_u32(identities.len() as u32);
            for identity in identities {
                wire::put_string(out, &identity.key_blob);
                wire::put_string(out, identity.comment.as_bytes());
            }
        }
        AgentResponse::SignResponse { signature_blob } => {
            out.put_u8(MessageType::SignResponse as u8);
            wire::put_string(out, signature_blob);
        }
        AgentResponse::NotYetSupported { message_number } => out.put_u8(*message_number),
    }
}

pub fn encode_response_frame(response: &AgentResponse) -> Bytes {
    let mut payload = BytesMut::new();
    encode_response(response, &mut payload);
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.put_slice(&payload);
    framed.freeze()
}

/// Decodes one response frame payload (frame length prefix already stripped).
pub fn decode_response(frame: &[u8]) -> Result<AgentResponse> {
    let mut reader = Reader::new(frame);
    let message_number = reader
        .read_u8()
        .ok_or(ProtoError::BadResponse("missing message number"))?;
    let response = match message_number {
        x if x == MessageType::Success as u8 => AgentResponse::Success,
        x if x == MessageType::Failure as u8 => AgentResponse::Failure,
        x if x == MessageType::IdentitiesAnswer as u8 => {
            let count = reader
                .read_u32()
                .ok_or(ProtoError::BadResponse("missing identity count"))?;
            let mut identities = Vec::with_capacity(count.min(64) as usize);
            for _ in 0..count {
                let key_blob = reader
                    .read_string()
                    .ok_or(ProtoError::BadResponse("truncated identity list"))?
                    .to_vec();
                let comment = reader
                    .read_string()
                    .ok_or(ProtoError::BadResponse("truncated identity list"))?;
                let comment = std::str::from_utf8(comment)
                    .map_err(|_| ProtoError::BadResponse("identity comment is not utf-8"))?
                    .to_string();
                identities.push(AgentIdentity { key_blob, comment });
            }
            AgentResponse::IdentitiesAnswer { identities }
        }
        x if x == MessageType::SignResponse as u8 => match reader.read_string() {
            Some(signature_blob) => AgentResponse::SignResponse {
                signature_blob: signature_blob.to_vec(),
            },
            // A sign response with no signature string at all is the agent's
            // way of declining.
            None if reader.is_empty() => AgentResponse::Failure,
            None => return Err(ProtoError::BadResponse("truncated signature blob")),
        },
        other => {
            // Carried through unparsed, trailing content and all.
            return Ok(AgentResponse::NotYetSupported {
                message_number: other,
            });
        }
    };
    if !reader.is_empty() {
        return Err(ProtoError::TrailingBytes(message_number));
    }
    Ok(response)
}

/// Decodes one request frame payload. The agent-to-client mirror of
/// [`encode_request`], used by mock agents and round-trip tests.
pub fn decode_request(frame: &[u8]) -> Result<AgentRequest> {
    let mut reader = Reader::new(frame);
    let message_number = reader
        .read_u8()
        .ok_or(ProtoError::InvalidMessage("missing message number"))?;
    let request = match message_number {
        x if x == MessageType::RequestIdentities as u8 => AgentRequest::RequestIdentities,
        x if x == MessageType::SignRequest as u8 => {
            let key_blob = reader
                .read_string()
                .ok_or(ProtoError::InvalidMessage("missing key blob"))?
                .to_vec();
            let data = reader
                .read_string()
                .ok_or(ProtoError::InvalidMessage("missing sign data"))?
                .to_vec();
            let flags = reader
                .read_u32()
                .ok_or(ProtoError::InvalidMessage("missing sign flags"))?;
            AgentRequest::SignRequest {
                key_blob,
                data,
                flags,
            }
        }
        x if x == MessageType::AddIdentity as u8 => {
            let mut fields = Vec::new();
            while let Some(field) = reader.read_string() {
                fields.push(field.to_vec());
            }
            if !reader.is_empty() {
                return Err(ProtoError::InvalidMessage("malformed identity field"));
            }
            AgentRequest::AddIdentity {
                identity: Identity { fields },
            }
        }
        _ => return Err(ProtoError::InvalidMessage("unrecognized request")),
    };
    if !reader.is_empty() {
        return Err(ProtoError::TrailingBytes(message_number));
    }
    Ok(request)
}

pub async fn read_response<R>(reader: &mut R) -> Result<AgentResponse>
where
    R: tokio::io::AsyncRead + Unpin,
{
    decode_response(&read_frame(reader).await?)
}

pub async fn read_request<R>(reader: &mut R) -> Result<AgentRequest>
where
    R: tokio::io::AsyncRead + Unpin,
{
    decode_request(&read_frame(reader).await?)
}

async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let len = reader
        .read_u32()
        .await
        .map_err(|_| ProtoError::UnexpectedEof)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|_| ProtoError::UnexpectedEof)?;
    Ok(frame)
}

pub async fn write_request<W>(writer: &mut W, request: &AgentRequest) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let frame = encode_request_frame(request);
    writer
        .write_all(&frame)
        .await
        .map_err(|_| ProtoError::UnexpectedEof)?;
    writer.flush().await.map_err(|_| ProtoError::UnexpectedEof)?;
    Ok(())
}

pub async fn write_response<W>(writer: &mut W, response: &AgentResponse) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let frame = encode_response_frame(response);
    writer
        .write_all(&frame)
        .await
        .map_err(|_| ProtoError::UnexpectedEof)?;
    writer.flush().await.map_err(|_| ProtoError::UnexpectedEof)?;
    Ok(())
}
