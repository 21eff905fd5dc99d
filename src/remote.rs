//! In-process message-passing endpoint. Requests and replies cross the
//! boundary only as MessagePack-encoded bytes, so a caller never shares state
//! with the object it talks to and every call can fail like a remote one.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::utils::RiverError;

use bytes::Bytes;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Capacity of an endpoint's request channel.
const CHAN_REQ_CAP: usize = 1024;

/// Encoded request paired with the channel its encoded reply goes back on.
type Envelope = (Bytes, oneshot::Sender<Bytes>);

/// Caller side of an exported endpoint.
pub(crate) struct RemoteStub<Req, Rep> {
    tx_req: mpsc::Sender<Envelope>,

    /// Per-call timeout; `None` to wait indefinitely.
    timeout: Option<Duration>,

    _types: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> Clone for RemoteStub<Req, Rep> {
    fn clone(&self) -> Self {
        RemoteStub {
            tx_req: self.tx_req.clone(),
            timeout: self.timeout,
            _types: PhantomData,
        }
    }
}

impl<Req, Rep> RemoteStub<Req, Rep>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sends one request and waits for its reply. Fails if the endpoint is
    /// gone, drops the call, or exceeds the timeout.
    pub(crate) async fn call(&self, req: &Req) -> Result<Rep, RiverError> {
        let req_bytes = Bytes::from(encode_to_vec(req)?);
        let (tx_rep, rx_rep) = oneshot::channel();
        if self.tx_req.send((req_bytes, tx_rep)).await.is_err() {
            return Err(RiverError::msg("remote endpoint unreachable"));
        }

        let rep_bytes = match self.timeout {
            Some(timeout) => time::timeout(timeout, rx_rep).await??,
            None => rx_rep.await?,
        };
        Ok(decode_from_slice(&rep_bytes)?)
    }
}

/// Exports `handler` as an endpoint. Returns the caller stub and the join
/// handle of the serving task; aborting that task makes every later call
/// fail as unreachable. The task ends once all stubs are dropped.
pub(crate) fn serve<Req, Rep, H, Fut>(
    handler: H,
) -> (RemoteStub<Req, Rep>, JoinHandle<()>)
where
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
    H: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Rep> + Send + 'static,
{
    let (tx_req, mut rx_req) = mpsc::channel::<Envelope>(CHAN_REQ_CAP);
    let handler = Arc::new(handler);

    let server = tokio::spawn(async move {
        pf_debug!("remote endpoint task spawned");

        while let Some((req_bytes, tx_rep)) = rx_req.recv().await {
            let req: Req = match decode_from_slice(&req_bytes) {
                Ok(req) => req,
                Err(e) => {
                    pf_error!("error decoding request: {}", e);
                    continue;
                }
            };

            // calls are served concurrently
            let handler = handler.clone();
            tokio::spawn(async move {
                let rep = handler(req).await;
                match encode_to_vec(&rep) {
                    Ok(rep_bytes) => {
                        if tx_rep.send(Bytes::from(rep_bytes)).is_err() {
                            pf_debug!("caller left before reply");
                        }
                    }
                    Err(e) => pf_error!("error encoding reply: {}", e),
                }
            });
        }

        pf_debug!("remote endpoint task exited");
    });

    (
        RemoteStub {
            tx_req,
            timeout: None,
            _types: PhantomData,
        },
        server,
    )
}
