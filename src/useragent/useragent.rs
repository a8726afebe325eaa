use super::transport::RsipTransport;
use crate::config::UseragentConfig;
use anyhow::{anyhow, Result};
use rsipstack::transaction::{Endpoint, TransactionReceiver};
use rsipstack::transport::{udp::UdpConnection, TransportLayer};
use rsipstack::EndpointBuilder;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

pub struct UserAgentBuilder {
    pub config: Option<UseragentConfig>,
    pub cancel_token: Option<CancellationToken>,
}

/// The local SIP endpoint every call is placed through.
pub struct UserAgent {
    pub config: UseragentConfig,
    pub token: CancellationToken,
    pub endpoint: Endpoint,
    /// Drains the transactions of one-off requests.
    pub tasks: TaskTracker,
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: Option<UseragentConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub async fn build(mut self) -> Result<UserAgent> {
        let token = self
            .cancel_token
            .take()
            .unwrap_or_else(|| CancellationToken::new());

        let config = self.config.to_owned().unwrap_or_default();
        let local_ip = if !config.addr.is_empty() {
            IpAddr::from_str(config.addr.as_str())?
        } else {
            crate::net_tool::get_first_non_loopback_interface()?
        };
        let transport_layer = TransportLayer::new(token.clone());
        let local_addr: SocketAddr = format!("{}:{}", local_ip, config.udp_port).parse()?;

        let udp_conn = UdpConnection::create_connection(local_addr, None)
            .await
            .map_err(|e| anyhow!("Failed to create UDP connection: {}", e))?;
        info!("useragent: udp transport on {}", udp_conn.get_addr());

        transport_layer.add_transport(udp_conn.into());

        let mut builder = EndpointBuilder::new();
        builder
            .cancel_token(token.child_token())
            .transport_layer(transport_layer);
        if let Some(ref useragent) = config.useragent {
            builder.user_agent(useragent);
        }
        let endpoint = builder.build();
        Ok(UserAgent {
            token,
            config,
            endpoint,
            tasks: TaskTracker::new(),
        })
    }
}

impl UserAgent {
    pub fn transport(&self) -> RsipTransport {
        RsipTransport::new(
            self.endpoint.inner.clone(),
            self.tasks.clone(),
            self.token.child_token(),
        )
    }

    /// Out-of-dialog requests: we never take calls, but a remote BYE or OPTIONS
    /// still deserves an answer.
    async fn process_incoming_request(&self, mut incoming: TransactionReceiver) -> Result<()> {
        while let Some(mut tx) = incoming.recv().await {
            info!("useragent: received {} {}", tx.original.method, tx.original.uri);
            let status = match tx.original.method {
                rsip::Method::Ack => continue,
                rsip::Method::Invite => rsip::StatusCode::Decline,
                _ => rsip::StatusCode::OK,
            };
            if let Err(e) = tx.reply(status).await {
                warn!("useragent: error replying to request: {:?}", e);
            }
        }
        Ok(())
    }

    pub async fn serve(&self) -> Result<()> {
        let incoming_txs = self.endpoint.incoming_transactions();
        let token = self.token.child_token();
        let endpoint_inner = self.endpoint.inner.clone();

        tokio::select! {
            _ = token.cancelled() => {
                info!("useragent: cancelled");
            }
            result = endpoint_inner.serve() => {
                if let Err(e) = result {
                    info!("useragent: endpoint serve error: {:?}", e);
                }
            }
            result = self.process_incoming_request(incoming_txs) => {
                if let Err(e) = result {
                    info!("useragent: process incoming request error: {:?}", e);
                }
            },
        }
        info!("useragent: stopped");
        Ok(())
    }

    pub fn stop(&self) {
        info!("useragent: stopping");
        self.token.cancel();
        self.tasks.close();
    }
}
