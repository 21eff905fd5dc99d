//! Landlord reachable only through a message-passing endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use crate::lease::{Landlord, LeaseError, RenewResults};
use crate::remote::{serve, RemoteStub};
use crate::utils::Uid;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
enum LandlordRequest {
    Renew { cookie: Uid, duration: i64 },
    Cancel { cookie: Uid },
    RenewAll { cookies: Vec<Uid>, durations: Vec<i64> },
    CancelAll { cookies: Vec<Uid> },
}

#[derive(Debug, Serialize, Deserialize)]
enum LandlordReply {
    Renew(Result<i64, LeaseError>),
    Cancel(Result<(), LeaseError>),
    RenewAll(Result<RenewResults, LeaseError>),
    CancelAll(Result<HashMap<Uid, LeaseError>, LeaseError>),
}

/// Client-side proxy of an exported landlord. Any transport failure surfaces
/// as `LeaseError::Remote`.
#[derive(Clone)]
pub struct RemoteLandlord {
    stub: RemoteStub<LandlordRequest, LandlordReply>,
}

impl RemoteLandlord {
    /// Exports `landlord` behind a fresh endpoint. Returns the proxy and the
    /// serving task's join handle.
    pub fn export(landlord: Arc<dyn Landlord>) -> (Self, JoinHandle<()>) {
        let (stub, server) = serve(move |req: LandlordRequest| {
            let landlord = landlord.clone();
            async move {
                match req {
                    LandlordRequest::Renew { cookie, duration } => {
                        LandlordReply::Renew(landlord.renew(cookie, duration).await)
                    }
                    LandlordRequest::Cancel { cookie } => {
                        LandlordReply::Cancel(landlord.cancel(cookie).await)
                    }
                    LandlordRequest::RenewAll { cookies, durations } => {
                        LandlordReply::RenewAll(
                            landlord.renew_all(&cookies, &durations).await,
                        )
                    }
                    LandlordRequest::CancelAll { cookies } => {
                        LandlordReply::CancelAll(landlord.cancel_all(&cookies).await)
                    }
                }
            }
        });
        (RemoteLandlord { stub }, server)
    }

    /// Bounds every call by `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        RemoteLandlord {
            stub: self.stub.with_timeout(timeout),
        }
    }

    async fn call(&self, req: LandlordRequest) -> Result<LandlordReply, LeaseError> {
        Ok(self.stub.call(&req).await?)
    }
}

fn unexpected(reply: LandlordReply) -> LeaseError {
    LeaseError::Remote(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl Landlord for RemoteLandlord {
    async fn renew(&self, cookie: Uid, duration: i64) -> Result<i64, LeaseError> {
        match self.call(LandlordRequest::Renew { cookie, duration }).await? {
            LandlordReply::Renew(res) => res,
            reply => Err(unexpected(reply)),
        }
    }

    async fn cancel(&self, cookie: Uid) -> Result<(), LeaseError> {
        match self.call(LandlordRequest::Cancel { cookie }).await? {
            LandlordReply::Cancel(res) => res,
            reply => Err(unexpected(reply)),
        }
    }

    async fn renew_all(
        &self,
        cookies: &[Uid],
        durations: &[i64],
    ) -> Result<RenewResults, LeaseError> {
        let req = LandlordRequest::RenewAll {
            cookies: cookies.to_vec(),
            durations: durations.to_vec(),
        };
        match self.call(req).await? {
            LandlordReply::RenewAll(res) => res,
            reply => Err(unexpected(reply)),
        }
    }

    async fn cancel_all(
        &self,
        cookies: &[Uid],
    ) -> Result<HashMap<Uid, LeaseError>, LeaseError> {
        let req = LandlordRequest::CancelAll {
            cookies: cookies.to_vec(),
        };
        match self.call(req).await? {
            LandlordReply::CancelAll(res) => res,
            reply => Err(unexpected(reply)),
        }
    }
}
