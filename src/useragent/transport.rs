use crate::call::SipCredential;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rsip::{message::SipMessage, prelude::HeadersExt, Method, Request, Response};
use rsipstack::{
    dialog::authenticate::{handle_client_authenticate, Credential},
    rsip_ext::RsipHeadersExt,
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
    },
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Responses of one sent request, in arrival order.
#[async_trait]
pub trait ResponseStream: Send {
    /// The request as it went on the wire, Via included.
    fn request(&self) -> &Request;
    /// `None` once no more responses will arrive.
    async fn next_response(&mut self) -> Option<Response>;
    /// Stops tracking the request; later calls to `next_response` yield `None`.
    fn retire(&mut self);
}

/// What the call engine needs from a SIP stack.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Box<dyn ResponseStream>>;

    /// Resends `request` with digest credentials computed against `challenge`.
    async fn send_authenticated(
        &self,
        request: &Request,
        challenge: &Response,
        credential: &SipCredential,
    ) -> Result<Box<dyn ResponseStream>>;

    /// Fire-and-forget: ACK, CANCEL and BYE go through here. An ACK leaves
    /// exactly once; CANCEL and BYE are retransmitted until answered.
    async fn write(&self, request: Request) -> Result<()>;
}

impl From<&SipCredential> for Credential {
    fn from(c: &SipCredential) -> Self {
        Credential {
            username: c.username.clone(),
            password: c.password.clone(),
        }
    }
}

/// `SessionTransport` over an rsipstack endpoint.
pub struct RsipTransport {
    endpoint_inner: EndpointInnerRef,
    /// Transactions of one-off requests, drained until answered or stopped.
    tasks: TaskTracker,
    token: CancellationToken,
}

struct TransactionResponses {
    request: Request,
    tx: Option<Transaction>,
}

impl RsipTransport {
    pub fn new(
        endpoint_inner: EndpointInnerRef,
        tasks: TaskTracker,
        token: CancellationToken,
    ) -> Self {
        Self {
            endpoint_inner,
            tasks,
            token,
        }
    }

    fn with_via(&self, mut request: Request) -> Result<Request> {
        if request.via_header().is_err() {
            let via = self
                .endpoint_inner
                .get_via(None, None)
                .map_err(|e| anyhow!("failed to build via: {}", e))?;
            request.headers.push_front(via.into());
        }
        Ok(request)
    }

    fn client_transaction(&self, request: Request) -> Result<Transaction> {
        let request = self.with_via(request)?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .map_err(|e| anyhow!("failed to build transaction key: {}", e))?;
        Ok(Transaction::new_client(
            key,
            request,
            self.endpoint_inner.clone(),
            None,
        ))
    }

    /// The ACK of a 2xx is not a transaction of its own: one datagram, no
    /// retransmission, nothing to wait for.
    async fn send_ack(&self, request: Request) -> Result<()> {
        let request = self.with_via(request)?;
        let connection = self
            .endpoint_inner
            .transport_layer
            .lookup(&request.uri, self.endpoint_inner.transport_tx.clone())
            .await
            .map_err(|e| anyhow!("no route to {}: {}", request.uri, e))?;
        connection
            .send(request.into(), None)
            .await
            .map_err(|e| anyhow!("failed to send ACK: {}", e))?;
        info!("ACK sent");
        Ok(())
    }
}

#[async_trait]
impl SessionTransport for RsipTransport {
    async fn send(&self, request: Request) -> Result<Box<dyn ResponseStream>> {
        let method = request.method;
        let mut tx = self.client_transaction(request)?;
        tx.send()
            .await
            .map_err(|e| anyhow!("failed to send {}: {}", method, e))?;
        info!(key = ?tx.key, "request sent");
        Ok(Box::new(TransactionResponses {
            request: tx.original.clone(),
            tx: Some(tx),
        }))
    }

    async fn send_authenticated(
        &self,
        request: &Request,
        challenge: &Response,
        credential: &SipCredential,
    ) -> Result<Box<dyn ResponseStream>> {
        let new_seq = request.cseq_header()?.seq()? + 1;
        let tx = self.client_transaction(request.clone())?;
        let mut tx =
            handle_client_authenticate(new_seq, tx, challenge.clone(), &credential.into())
                .await
                .map_err(|e| anyhow!("failed to apply credentials: {}", e))?;
        tx.send()
            .await
            .map_err(|e| anyhow!("failed to resend with credentials: {}", e))?;
        info!(key = ?tx.key, seq = new_seq, "authenticated request sent");
        Ok(Box::new(TransactionResponses {
            request: tx.original.clone(),
            tx: Some(tx),
        }))
    }

    async fn write(&self, request: Request) -> Result<()> {
        let method = request.method;
        if method == Method::Ack {
            return self.send_ack(request).await;
        }
        let mut tx = self.client_transaction(request)?;
        tx.send()
            .await
            .map_err(|e| anyhow!("failed to send {}: {}", method, e))?;
        // retransmissions continue while the transaction is polled
        let token = self.token.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = async {
                    while let Some(msg) = tx.receive().await {
                        if let SipMessage::Response(resp) = msg {
                            debug!(
                                %method,
                                status = %resp.status_code,
                                "response to one-off request"
                            );
                        }
                    }
                } => {}
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ResponseStream for TransactionResponses {
    fn request(&self) -> &Request {
        &self.request
    }

    async fn next_response(&mut self) -> Option<Response> {
        let tx = self.tx.as_mut()?;
        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => return Some(resp),
                SipMessage::Request(req) => {
                    warn!(method = %req.method, "unexpected request on client transaction");
                }
            }
        }
        None
    }

    fn retire(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!(key = ?tx.key, "transaction retired");
        }
    }
}
