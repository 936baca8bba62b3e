//! Single-in-flight transaction discipline.
//!
//! The agent protocol carries no request ids; responses match requests by
//! arrival order. The channel therefore admits one transaction at a time and
//! rejects overlapping submissions instead of queueing them. Transitions
//! return an [`Action`] that the I/O loop executes after the state has
//! settled, so slot resolution can never re-enter a transition.

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::warn;

use agentlink_proto::{encode_request_frame, AgentRequest, AgentResponse};

use crate::{AgentError, Result};

pub(crate) type ResponseSlot = oneshot::Sender<Result<AgentResponse>>;

/// One request paired with the slot its response is delivered through. The
/// slot is resolved exactly once: with the decoded response, or with the
/// error that terminated the transaction.
pub struct Transaction {
    pub request: AgentRequest,
    pub slot: ResponseSlot,
}

impl Transaction {
    pub fn new(request: AgentRequest) -> (Self, oneshot::Receiver<Result<AgentResponse>>) {
        let (slot, response) = oneshot::channel();
        (Self { request, slot }, response)
    }
}

pub(crate) enum Action {
    None,
    Send(Bytes),
    Resolve(ResponseSlot, Result<AgentResponse>),
}

enum State {
    Idle,
    Pending(ResponseSlot),
}

pub(crate) struct Channel {
    state: State,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self { state: State::Idle }
    }

    pub(crate) fn submit(&mut self, transaction: Transaction) -> Action {
        match self.state {
            State::Idle => {
                let frame = encode_request_frame(&transaction.request);
                self.state = State::Pending(transaction.slot);
                Action::Send(frame)
            }
            State::Pending(_) => {
                Action::Resolve(transaction.slot, Err(AgentError::OperationInProgress))
            }
        }
    }

    pub(crate) fn complete(&mut self, result: Result<AgentResponse>) -> Action {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Pending(slot) => Action::Resolve(slot, result),
            State::Idle => {
                // Peer bug: nothing was in flight. Absorbed, not propagated.
                warn!("dropping response with no transaction in flight");
                Action::None
            }
        }
    }

    pub(crate) fn close(&mut self) -> Action {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Pending(slot) => Action::Resolve(
                slot,
                Err(AgentError::AgentNotAvailable("channel inactive".to_string())),
            ),
            State::Idle => Action::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction() -> (Transaction, oneshot::Receiver<Result<AgentResponse>>) {
        Transaction::new(AgentRequest::RequestIdentities)
    }

    #[test]
    fn submit_while_idle_emits_request_bytes() {
        let mut channel = Channel::new();
        let (tx, mut response) = transaction();
        match channel.submit(tx) {
            Action::Send(frame) => assert_eq!(&frame[..], &[0, 0, 0, 1, 11]),
            _ => panic!("expected send action"),
        }
        assert!(response.try_recv().is_err());
    }

    #[test]
    fn overlapping_submit_is_rejected_without_emitting() {
        let mut channel = Channel::new();
        let (first, mut first_response) = transaction();
        let (second, _) = transaction();

        assert!(matches!(channel.submit(first), Action::Send(_)));
        match channel.submit(second) {
            Action::Resolve(slot, result) => {
                assert_eq!(result, Err(AgentError::OperationInProgress));
                drop(slot);
            }
            _ => panic!("expected resolve action"),
        }

        // The first transaction is unaffected and still completes.
        match channel.complete(Ok(AgentResponse::Success)) {
            Action::Resolve(slot, result) => {
                let _ = slot.send(result);
            }
            _ => panic!("expected resolve action"),
        }
        assert_eq!(
            first_response.try_recv().expect("resolved"),
            Ok(AgentResponse::Success)
        );
    }

    #[test]
    fn response_while_idle_is_dropped() {
        let mut channel = Channel::new();
        assert!(matches!(
            channel.complete(Ok(AgentResponse::Success)),
            Action::None
        ));
    }

    #[test]
    fn close_resolves_pending_transaction() {
        let mut channel = Channel::new();
        let (tx, _response) = transaction();
        assert!(matches!(channel.submit(tx), Action::Send(_)));

        match channel.close() {
            Action::Resolve(_, result) => {
                assert!(matches!(result, Err(AgentError::AgentNotAvailable(_))));
            }
            _ => panic!("expected resolve action"),
        }
        // Back to idle: a later close is a no-op.
        assert!(matches!(channel.close(), Action::None));
    }
}
