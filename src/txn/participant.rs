//! Participant protocol and its message-passing proxy.

use std::sync::Arc;

use crate::remote::{serve, RemoteStub};
use crate::txn::{TxnError, TxnState, Vote};
use crate::utils::Uid;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Resource manager taking part in a transaction.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Asks the participant to become ready to commit `id`.
    async fn prepare(&self, id: Uid) -> Result<Vote, TxnError>;

    /// Makes the prepared changes of `id` permanent.
    async fn commit(&self, id: Uid) -> Result<(), TxnError>;

    /// Rolls back every change of `id`.
    async fn abort(&self, id: Uid) -> Result<(), TxnError>;

    /// Prepare followed by commit in one call, used when the participant is
    /// the only one. Answers COMMITTED, NOTCHANGED, or ABORTED.
    async fn prepare_and_commit(&self, id: Uid) -> Result<TxnState, TxnError> {
        match self.prepare(id).await? {
            Vote::Prepared => {
                self.commit(id).await?;
                Ok(TxnState::Committed)
            }
            Vote::NotChanged => Ok(TxnState::NotChanged),
            Vote::Aborted => Ok(TxnState::Aborted),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ParticipantRequest {
    Prepare(Uid),
    Commit(Uid),
    Abort(Uid),
    PrepareAndCommit(Uid),
}

#[derive(Debug, Serialize, Deserialize)]
enum ParticipantReply {
    Prepare(Result<Vote, TxnError>),
    Commit(Result<(), TxnError>),
    Abort(Result<(), TxnError>),
    PrepareAndCommit(Result<TxnState, TxnError>),
}

/// Coordinator-side proxy of an exported participant. Transport failures
/// surface as `TxnError::Remote`.
#[derive(Clone)]
pub struct RemoteParticipant {
    stub: RemoteStub<ParticipantRequest, ParticipantReply>,
}

impl RemoteParticipant {
    /// Exports `participant` behind a fresh endpoint.
    pub fn export(participant: Arc<dyn Participant>) -> (Self, JoinHandle<()>) {
        let (stub, server) = serve(move |req: ParticipantRequest| {
            let participant = participant.clone();
            async move {
                match req {
                    ParticipantRequest::Prepare(id) => {
                        ParticipantReply::Prepare(participant.prepare(id).await)
                    }
                    ParticipantRequest::Commit(id) => {
                        ParticipantReply::Commit(participant.commit(id).await)
                    }
                    ParticipantRequest::Abort(id) => {
                        ParticipantReply::Abort(participant.abort(id).await)
                    }
                    ParticipantRequest::PrepareAndCommit(id) => {
                        ParticipantReply::PrepareAndCommit(
                            participant.prepare_and_commit(id).await,
                        )
                    }
                }
            }
        });
        (RemoteParticipant { stub }, server)
    }

    /// Bounds every call by `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        RemoteParticipant {
            stub: self.stub.with_timeout(timeout),
        }
    }

    async fn call(
        &self,
        req: ParticipantRequest,
    ) -> Result<ParticipantReply, TxnError> {
        Ok(self.stub.call(&req).await?)
    }
}

fn unexpected(reply: ParticipantReply) -> TxnError {
    TxnError::Remote(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl Participant for RemoteParticipant {
    async fn prepare(&self, id: Uid) -> Result<Vote, TxnError> {
        match self.call(ParticipantRequest::Prepare(id)).await? {
            ParticipantReply::Prepare(res) => res,
            reply => Err(unexpected(reply)),
        }
    }

    async fn commit(&self, id: Uid) -> Result<(), TxnError> {
        match self.call(ParticipantRequest::Commit(id)).await? {
            ParticipantReply::Commit(res) => res,
            reply => Err(unexpected(reply)),
        }
    }

    async fn abort(&self, id: Uid) -> Result<(), TxnError> {
        match self.call(ParticipantRequest::Abort(id)).await? {
            ParticipantReply::Abort(res) => res,
            reply => Err(unexpected(reply)),
        }
    }

    async fn prepare_and_commit(&self, id: Uid) -> Result<TxnState, TxnError> {
        match self.call(ParticipantRequest::PrepareAndCommit(id)).await? {
            ParticipantReply::PrepareAndCommit(res) => res,
            reply => Err(unexpected(reply)),
        }
    }
}
