use crate::call::{CallConfig, CallEngine, CallError, CallOutcome, CallStatus, StatusSender};
use crate::config::Config;
use crate::handler::middleware::request_log::log_requests;
use crate::useragent::{SessionTransport, UserAgent, UserAgentBuilder};
use anyhow::Result;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Upper bound on how long shutdown waits for running calls to send their cleanup.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub call: Arc<CallConfig>,
    pub transport: Arc<dyn SessionTransport>,
    pub useragent: Option<Arc<UserAgent>>,
    /// Operator shutdown. Calls watch a child of it; the SIP endpoint does not,
    /// so cleanup requests still go out after it fires.
    pub token: CancellationToken,
    pub tasks: TaskTracker,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub useragent: Option<Arc<UserAgent>>,
    pub transport: Option<Arc<dyn SessionTransport>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            useragent: None,
            transport: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_useragent(mut self, useragent: Arc<UserAgent>) -> Self {
        self.useragent = Some(useragent);
        self
    }

    /// Places calls through `transport` instead of a SIP endpoint of our own.
    pub fn with_transport(mut self, transport: Arc<dyn SessionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let call = Arc::new(config.call_config()?);
        let token = CancellationToken::new();

        let (useragent, transport) = match (self.transport, self.useragent) {
            (Some(transport), useragent) => (useragent, transport),
            (None, Some(ua)) => {
                let transport: Arc<dyn SessionTransport> = Arc::new(ua.transport());
                (Some(ua), transport)
            }
            (None, None) => {
                let ua = UserAgentBuilder::new()
                    .with_config(Some(config.ua.clone()))
                    .with_cancel_token(CancellationToken::new())
                    .build()
                    .await?;
                let ua = Arc::new(ua);
                let transport: Arc<dyn SessionTransport> = Arc::new(ua.transport());
                (Some(ua), transport)
            }
        };

        Ok(Arc::new(AppStateInner {
            config,
            call,
            transport,
            useragent,
            token,
            tasks: TaskTracker::new(),
        }))
    }
}

impl AppStateInner {
    /// Host put in the INVITE's Contact: the configured external address, or
    /// whatever the lookup endpoints report. `None` on shutdown.
    async fn contact_host(&self) -> Option<Result<String, CallError>> {
        if let Some(ref ip) = self.config.ua.external_ip {
            return Some(Ok(ip.clone()));
        }
        info!("discovering public address");
        let lookup = crate::net_tool::discover_public_ip(
            &self.config.lookup.endpoints,
            self.config.lookup.timeout(),
        );
        select! {
            _ = self.token.cancelled() => None,
            result = lookup => Some(result.map_err(|e| CallError::Resolve(e.to_string()))),
        }
    }

    /// Resolves the contact address, then runs one call to completion.
    pub async fn place_call(&self, status: StatusSender) -> Result<CallOutcome, CallError> {
        let contact = match self.contact_host().await {
            Some(Ok(contact)) => contact,
            Some(Err(e)) => {
                warn!("{}", e);
                status.send(CallStatus::Error);
                return Err(e);
            }
            None => return Ok(CallOutcome::Interrupted),
        };
        CallEngine::new(self.call.clone(), self.transport.clone(), contact, status)
            .run(self.token.child_token())
            .await
    }

    /// Cancels running calls, waits for their cleanup, then stops the endpoint.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "{} call(s) still running after {:?}",
                self.tasks.len(),
                SHUTDOWN_GRACE
            );
        }
        if let Some(ref ua) = self.useragent {
            ua.stop();
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    crate::handler::router()
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

/// Serves HTTP and the SIP endpoint until the app token fires.
pub async fn run(state: AppState) -> Result<()> {
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };
    info!("listening on {}", listener.local_addr()?);

    let token = state.token.clone();
    let http_task = axum::serve(
        listener,
        create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await });

    let ua = state.useragent.clone();
    let ua_token = state.token.clone();
    let ua_task = async move {
        match ua {
            Some(ua) => ua.serve().await,
            None => {
                ua_token.cancelled().await;
                Ok(())
            }
        }
    };

    let result = select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => {
                    info!("Server shut down gracefully");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    Err(anyhow::anyhow!("Server error: {}", e))
                }
            }
        }
        ua_result = ua_task => {
            match ua_result {
                Ok(_) => Ok(()),
                Err(e) => {
                    tracing::error!("User agent server error: {}", e);
                    Err(anyhow::anyhow!("User agent server error: {}", e))
                }
            }
        }
    };
    state.shutdown().await;
    result
}
