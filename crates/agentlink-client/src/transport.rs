use std::io;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use agentlink_proto::{decode_frame, decode_response, AgentRequest, AgentResponse};

use crate::channel::{Action, Channel, Transaction};
use crate::{AgentError, Result};

/// Handle to one agent connection. Cheap to clone; all clones feed the same
/// I/O task and share its one-at-a-time transaction discipline.
#[derive(Clone)]
pub struct Connection {
    submissions: mpsc::UnboundedSender<Transaction>,
}

impl Connection {
    /// Hands a transaction to the I/O task. The outcome — response, rejection
    /// or transport failure — arrives through the transaction's slot.
    pub fn submit(&self, transaction: Transaction) {
        if let Err(rejected) = self.submissions.send(transaction) {
            let _ = rejected.0.slot.send(Err(AgentError::AgentNotAvailable(
                "channel inactive".to_string(),
            )));
        }
    }

    /// Submits a request and awaits its response.
    pub async fn transact(&self, request: AgentRequest) -> Result<AgentResponse> {
        let (transaction, response) = Transaction::new(request);
        self.submit(transaction);
        response
            .await
            .map_err(|_| AgentError::AgentNotAvailable("channel inactive".to_string()))?
    }

    pub fn is_closed(&self) -> bool {
        self.submissions.is_closed()
    }
}

#[cfg(unix)]
pub async fn connect(socket_path: &Path) -> io::Result<Connection> {
    let stream = tokio::net::UnixStream::connect(socket_path).await?;
    Ok(spawn(stream))
}

#[cfg(windows)]
pub async fn connect(socket_path: &Path) -> io::Result<Connection> {
    use tokio::net::windows::named_pipe::ClientOptions;
    let stream = ClientOptions::new().open(socket_path.to_string_lossy().as_ref())?;
    Ok(spawn(stream))
}

pub(crate) fn spawn<S>(stream: S) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (submissions, inbox) = mpsc::unbounded_channel();
    tokio::spawn(run(stream, inbox));
    Connection { submissions }
}

#[cfg(unix)]
pub fn default_socket_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AGENTLINK_SOCK") {
        return Some(PathBuf::from(path));
    }
    std::env::var("SSH_AUTH_SOCK").ok().map(PathBuf::from)
}

#[cfg(windows)]
pub fn default_socket_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AGENTLINK_PIPE") {
        return Some(PathBuf::from(normalize_pipe_name(path)));
    }
    Some(PathBuf::from(r"\\.\pipe\openssh-ssh-agent"))
}

#[cfg(windows)]
fn normalize_pipe_name(value: String) -> String {
    const PREFIX: &str = r"\\.\pipe\";
    if value.starts_with(PREFIX) {
        return value;
    }
    let name = value
        .trim_start_matches(|c| c == '\\' || c == '/')
        .trim_start_matches("pipe\\")
        .trim_start_matches("pipe/");
    format!("{PREFIX}{name}")
}

/// Connection I/O task. All channel transitions happen here, on one task, so
/// operations on a single connection are totally ordered without locks.
async fn run<S>(stream: S, mut submissions: mpsc::UnboundedReceiver<Transaction>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut channel = Channel::new();
    let mut inbound = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            submission = submissions.recv() => {
                let Some(transaction) = submission else {
                    // Every handle dropped; resolve whatever is in flight.
                    perform(channel.close(), &mut writer).await;
                    break;
                };
                let action = channel.submit(transaction);
                if !perform(action, &mut writer).await {
                    warn!("agent connection lost while writing");
                    perform(channel.close(), &mut writer).await;
                    break;
                }
            }
            read = reader.read_buf(&mut inbound) => {
                match read {
                    Ok(0) => {
                        debug!("agent closed the connection");
                        perform(channel.close(), &mut writer).await;
                        break;
                    }
                    Err(err) => {
                        warn!(?err, "agent connection read failed");
                        perform(channel.close(), &mut writer).await;
                        break;
                    }
                    Ok(_) => {
                        if !drain_frames(&mut channel, &mut inbound) {
                            perform(channel.close(), &mut writer).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    // Reject anything queued behind the failure.
    while let Ok(transaction) = submissions.try_recv() {
        let _ = transaction.slot.send(Err(AgentError::AgentNotAvailable(
            "channel inactive".to_string(),
        )));
    }
}

/// Decodes every complete frame buffered so far. Returns false when a codec
/// error ended the connection.
fn drain_frames(channel: &mut Channel, inbound: &mut BytesMut) -> bool {
    loop {
        match decode_frame(inbound) {
            Ok(None) => return true,
            Ok(Some(frame)) => {
                let result: Result<AgentResponse> =
                    decode_response(&frame).map_err(AgentError::from);
                let failed = result.is_err();
                if let Err(err) = &result {
                    warn!(%err, "malformed response frame");
                }
                let action = channel.complete(result);
                execute(action);
                if failed {
                    return false;
                }
            }
            Err(err) => {
                warn!(%err, "broken response framing");
                execute(channel.complete(Err(err.into())));
                return false;
            }
        }
    }
}

/// Executes a transition's side effect after the state has settled. Returns
/// false when the transport write failed.
async fn perform<W>(action: Action, writer: &mut W) -> bool
where
    W: AsyncWrite + Unpin,
{
    match action {
        Action::None => true,
        Action::Resolve(slot, result) => {
            let _ = slot.send(result);
            true
        }
        Action::Send(frame) => {
            if writer.write_all(&frame).await.is_err() {
                return false;
            }
            writer.flush().await.is_ok()
        }
    }
}

fn execute(action: Action) {
    match action {
        Action::None | Action::Send(_) => {}
        Action::Resolve(slot, result) => {
            let _ = slot.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentlink_proto::{read_request, write_response, AgentIdentity};
    use tokio::sync::oneshot;

    fn sample_identity() -> AgentIdentity {
        AgentIdentity {
            key_blob: b"publickey".to_vec(),
            comment: "comment".to_string(),
        }
    }

    #[tokio::test]
    async fn transaction_resolves_with_decoded_response() {
        let (client_io, mut agent_io) = tokio::io::duplex(4096);
        let connection = spawn(client_io);

        let agent = tokio::spawn(async move {
            let request = read_request(&mut agent_io).await.expect("request");
            assert_eq!(request, AgentRequest::RequestIdentities);
            write_response(
                &mut agent_io,
                &AgentResponse::IdentitiesAnswer {
                    identities: vec![sample_identity()],
                },
            )
            .await
            .expect("response");
        });

        let response = connection
            .transact(AgentRequest::RequestIdentities)
            .await
            .expect("transact");
        assert_eq!(
            response,
            AgentResponse::IdentitiesAnswer {
                identities: vec![sample_identity()],
            }
        );
        agent.await.expect("agent task");
    }

    #[tokio::test]
    async fn second_transaction_rejected_while_first_pending() {
        let (client_io, mut agent_io) = tokio::io::duplex(4096);
        let connection = spawn(client_io);
        let (release, released) = oneshot::channel::<()>();

        let agent = tokio::spawn(async move {
            let first = read_request(&mut agent_io).await.expect("request");
            assert_eq!(first, AgentRequest::RequestIdentities);
            released.await.expect("release signal");
            write_response(
                &mut agent_io,
                &AgentResponse::IdentitiesAnswer {
                    identities: Vec::new(),
                },
            )
            .await
            .expect("response");
            // Exactly one request was emitted for the two submissions.
            let mut rest = Vec::new();
            use tokio::io::AsyncReadExt;
            agent_io.read_to_end(&mut rest).await.expect("eof");
            assert!(rest.is_empty());
        });

        let (first, first_response) = Transaction::new(AgentRequest::RequestIdentities);
        let (second, second_response) = Transaction::new(AgentRequest::RequestIdentities);
        connection.submit(first);
        connection.submit(second);

        assert_eq!(
            second_response.await.expect("resolved"),
            Err(AgentError::OperationInProgress)
        );

        release.send(()).expect("release");
        assert_eq!(
            first_response.await.expect("resolved"),
            Ok(AgentResponse::IdentitiesAnswer {
                identities: Vec::new(),
            })
        );

        drop(connection);
        agent.await.expect("agent task");
    }

    #[tokio::test]
    async fn transport_loss_resolves_pending_transaction() {
        let (client_io, agent_io) = tokio::io::duplex(4096);
        let connection = spawn(client_io);

        let (transaction, response) = Transaction::new(AgentRequest::RequestIdentities);
        connection.submit(transaction);
        drop(agent_io);

        assert!(matches!(
            response.await.expect("resolved"),
            Err(AgentError::AgentNotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn submissions_after_loss_fail_immediately() {
        let (client_io, agent_io) = tokio::io::duplex(4096);
        let connection = spawn(client_io);
        drop(agent_io);

        // Wait for the I/O task to observe the loss.
        while !connection.is_closed() {
            tokio::task::yield_now().await;
        }

        let result = connection.transact(AgentRequest::RequestIdentities).await;
        assert!(matches!(result, Err(AgentError::AgentNotAvailable(_))));
    }

    #[tokio::test]
    async fn trailing_bytes_fail_the_transaction() {
        let (client_io, mut agent_io) = tokio::io::duplex(4096);
        let connection = spawn(client_io);

        let agent = tokio::spawn(async move {
            let _ = read_request(&mut agent_io).await.expect("request");
            use tokio::io::AsyncWriteExt;
            // SUCCESS with one stray byte.
            agent_io
                .write_all(&[0, 0, 0, 2, 6, 0])
                .await
                .expect("write");
        });

        let result = connection.transact(AgentRequest::RequestIdentities).await;
        assert_eq!(
            result,
            Err(AgentError::Proto(agentlink_proto::ProtoError::TrailingBytes(6)))
        );
        agent.await.expect("agent task");
    }
}
