//! Shared-connection facade.
//!
//! One [`AgentClient`] keeps a single agent connection for all callers. The
//! lifecycle state is guarded by a mutex held only across the transition
//! itself; waiter slots are resolved after the lock is released. There is no
//! automatic reconnect: once the dial or the transport has failed, callers
//! construct a new facade to retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use agentlink_proto::{AgentIdentity, AgentRequest, AgentResponse, Identity};

use crate::transport::{self, Connection};
use crate::{AgentError, Result};

type ConnectionSlot = oneshot::Sender<Result<Connection>>;

enum Lifecycle {
    NotConnected,
    Connecting(Vec<ConnectionSlot>),
    Connected {
        conn: Connection,
        identities: Option<Vec<AgentIdentity>>,
    },
    Failed(AgentError),
}

#[derive(Clone)]
pub struct AgentClient {
    socket_path: Arc<PathBuf>,
    state: Arc<Mutex<Lifecycle>>,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Arc::new(socket_path.into()),
            state: Arc::new(Mutex::new(Lifecycle::NotConnected)),
        }
    }

    /// Uses `SSH_AUTH_SOCK` (with the `AGENTLINK_SOCK` override) to locate
    /// the agent.
    pub fn from_env() -> Result<Self> {
        let path = transport::default_socket_path().ok_or_else(|| {
            AgentError::AgentNotAvailable("SSH_AUTH_SOCK is not set".to_string())
        })?;
        Ok(Self::new(path))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the shared connection, dialing it on first use. Concurrent
    /// callers during the dial all wait on the same attempt.
    pub async fn connection(&self) -> Result<Connection> {
        let (pending, dial) = {
            let mut state = self.state.lock().await;
            match &mut *state {
                Lifecycle::NotConnected => {
                    let (slot, pending) = oneshot::channel();
                    *state = Lifecycle::Connecting(vec![slot]);
                    (pending, true)
                }
                Lifecycle::Connecting(waiters) => {
                    let (slot, pending) = oneshot::channel();
                    waiters.push(slot);
                    (pending, false)
                }
                Lifecycle::Connected { conn, .. } => {
                    if conn.is_closed() {
                        let err =
                            AgentError::AgentNotAvailable("agent connection lost".to_string());
                        *state = Lifecycle::Failed(err.clone());
                        return Err(err);
                    }
                    return Ok(conn.clone());
                }
                Lifecycle::Failed(err) => return Err(err.clone()),
            }
        };
        if dial {
            self.spawn_dial();
        }
        pending
            .await
            .map_err(|_| AgentError::AgentNotAvailable("connect aborted".to_string()))?
    }

    fn spawn_dial(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            let dialed = transport::connect(&client.socket_path)
                .await
                .map_err(|err| AgentError::AgentNotAvailable(err.to_string()));

            let (result, waiters) = {
                let mut state = client.state.lock().await;
                match std::mem::replace(&mut *state, Lifecycle::NotConnected) {
                    Lifecycle::Connecting(waiters) => match dialed {
                        Ok(conn) => {
                            *state = Lifecycle::Connected {
                                conn: conn.clone(),
                                identities: None,
                            };
                            (Ok(conn), waiters)
                        }
                        Err(err) => {
                            *state = Lifecycle::Failed(err.clone());
                            (Err(err), waiters)
                        }
                    },
                    other => {
                        *state = other;
                        (
                            Err(AgentError::AgentNotAvailable("connect aborted".to_string())),
                            Vec::new(),
                        )
                    }
                }
            };
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    /// Lists the keys held by the agent. Once listed, the answer is cached
    /// and served to later callers; the cache is invalidated only when the
    /// connection is lost.
    pub async fn identities(&self) -> Result<Vec<AgentIdentity>> {
        if let Some(cached) = self.cached_identities().await? {
            return Ok(cached);
        }
        let conn = self.connection().await?;
        match conn.transact(AgentRequest::RequestIdentities).await? {
            AgentResponse::IdentitiesAnswer { identities } => {
                let mut state = self.state.lock().await;
                if let Lifecycle::Connected {
                    identities: cache, ..
                } = &mut *state
                {
                    *cache = Some(identities.clone());
                }
                Ok(identities)
            }
            AgentResponse::Failure => Err(AgentError::Refused),
            _ => Err(AgentError::UnexpectedResponse("list identities")),
        }
    }

    async fn cached_identities(&self) -> Result<Option<Vec<AgentIdentity>>> {
        let mut state = self.state.lock().await;
        match &mut *state {
            Lifecycle::Connected {
                conn,
                identities: Some(cached),
            } => {
                if conn.is_closed() {
                    let err = AgentError::AgentNotAvailable("agent connection lost".to_string());
                    *state = Lifecycle::Failed(err.clone());
                    return Err(err);
                }
                debug!(count = cached.len(), "serving cached identities");
                Ok(Some(cached.clone()))
            }
            _ => Ok(None),
        }
    }

    /// Asks the agent to sign `data` with the key identified by `key_blob`.
    /// Returns the opaque signature blob.
    pub async fn sign(&self, key_blob: Vec<u8>, data: Vec<u8>, flags: u32) -> Result<Vec<u8>> {
        let conn = self.connection().await?;
        let request = AgentRequest::SignRequest {
            key_blob,
            data,
            flags,
        };
        match conn.transact(request).await? {
            AgentResponse::SignResponse { signature_blob } => Ok(signature_blob),
            AgentResponse::Failure => Err(AgentError::Refused),
            _ => Err(AgentError::UnexpectedResponse("sign request")),
        }
    }

    /// Hands a parsed private key to the agent.
    pub async fn add_identity(&self, identity: &Identity) -> Result<()> {
        let conn = self.connection().await?;
        let request = AgentRequest::AddIdentity {
            identity: identity.clone(),
        };
        match conn.transact(request).await? {
            AgentResponse::Success => Ok(()),
            AgentResponse::Failure => Err(AgentError::Refused),
            _ => Err(AgentError::UnexpectedResponse("add identity")),
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agentlink_proto::{read_request, write_response, ProtoError};
    use tokio::net::{UnixListener, UnixStream};

    struct MockAgent {
        _dir: tempfile::TempDir,
        socket_path: PathBuf,
        accepts: Arc<AtomicUsize>,
        list_requests: Arc<AtomicUsize>,
        connections: Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    }

    impl MockAgent {
        fn start() -> MockAgent {
            let dir = tempfile::tempdir().expect("tempdir");
            let socket_path = dir.path().join("agent.sock");
            let listener = UnixListener::bind(&socket_path).expect("bind");
            let accepts = Arc::new(AtomicUsize::new(0));
            let list_requests = Arc::new(AtomicUsize::new(0));
            let connections = Arc::new(std::sync::Mutex::new(Vec::new()));

            let accepted = accepts.clone();
            let listed = list_requests.clone();
            let serving = connections.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let handle = tokio::spawn(serve(stream, listed.clone()));
                    serving.lock().expect("serving lock").push(handle);
                }
            });

            MockAgent {
                _dir: dir,
                socket_path,
                accepts,
                list_requests,
                connections,
            }
        }

        fn client(&self) -> AgentClient {
            AgentClient::new(&self.socket_path)
        }

        /// Severs every established connection, leaving the listener up.
        fn drop_connections(&self) {
            for handle in self.connections.lock().expect("serving lock").drain(..) {
                handle.abort();
            }
        }
    }

    async fn serve(stream: UnixStream, list_requests: Arc<AtomicUsize>) {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let request = match read_request(&mut reader).await {
                Ok(request) => request,
                Err(ProtoError::UnexpectedEof) => break,
                Err(err) => panic!("mock agent read failed: {err}"),
            };
            let response = match request {
                AgentRequest::RequestIdentities => {
                    list_requests.fetch_add(1, Ordering::SeqCst);
                    AgentResponse::IdentitiesAnswer {
                        identities: vec![AgentIdentity {
                            key_blob: b"publickey".to_vec(),
                            comment: "comment".to_string(),
                        }],
                    }
                }
                AgentRequest::SignRequest { data, .. } => AgentResponse::SignResponse {
                    signature_blob: data.iter().rev().copied().collect(),
                },
                AgentRequest::AddIdentity { .. } => AgentResponse::Success,
            };
            if write_response(&mut writer, &response).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn cloned_handles_share_one_connection() {
        let agent = MockAgent::start();
        let client = agent.client();

        for _ in 0..4 {
            let handle = client.clone();
            let signature = handle
                .sign(b"publickey".to_vec(), vec![1, 2, 3], 0)
                .await
                .expect("sign");
            assert_eq!(signature, vec![3, 2, 1]);
        }
        assert_eq!(agent.accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identities_are_cached_until_transport_loss() {
        let agent = MockAgent::start();
        let client = agent.client();

        let first = client.identities().await.expect("identities");
        let second = client.identities().await.expect("identities");
        assert_eq!(first, second);
        assert_eq!(agent.list_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_then_sign_round_trip() {
        let agent = MockAgent::start();
        let client = agent.client();

        let identity = Identity {
            fields: vec![
                b"ssh-ed25519".to_vec(),
                vec![7; 32],
                vec![9; 64],
                b"unit@agentlink".to_vec(),
            ],
        };
        client.add_identity(&identity).await.expect("add");

        let signature = client
            .sign(b"publickey".to_vec(), vec![9, 8, 7], 0)
            .await
            .expect("sign");
        assert_eq!(signature, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn failed_dial_is_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = AgentClient::new(dir.path().join("absent.sock"));

        let first = client.connection().await;
        assert!(matches!(first, Err(AgentError::AgentNotAvailable(_))));

        // Later callers observe the terminal failure without redialing.
        let second = client.connection().await;
        assert!(matches!(second, Err(AgentError::AgentNotAvailable(_))));
    }

    #[tokio::test]
    async fn transport_loss_invalidates_cache_and_fails_facade() {
        let agent = MockAgent::start();
        let client = agent.client();

        client.identities().await.expect("identities");
        agent.drop_connections();

        // The cache stops being served once the loss is observed; the facade
        // turns terminal instead of reconnecting.
        loop {
            match client.identities().await {
                Ok(_) => tokio::task::yield_now().await,
                Err(err) => {
                    assert!(matches!(err, AgentError::AgentNotAvailable(_)));
                    break;
                }
            }
        }
        let after = client.identities().await;
        assert!(matches!(after, Err(AgentError::AgentNotAvailable(_))));
    }
}
