use axum::extract::{ConnectInfo, FromRequestParts};
use http::{request::Parts, StatusCode};
use std::{
    fmt::{self, Formatter},
    net::SocketAddr,
};

const FORWARDED_HEADERS: [&str; 4] = [
    "x-client-ip",
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
];

/// Caller address for logs: the first proxy header present, else the peer address.
#[derive(Debug, Clone)]
pub struct ClientIp(String);

impl ClientIp {
    fn from_parts(parts: &Parts) -> Self {
        for header in FORWARDED_HEADERS {
            if let Some(ip) = parts.headers.get(header).and_then(|v| v.to_str().ok()) {
                // X-Forwarded-For may carry a chain
                let first_ip = ip.split(',').next().unwrap_or(ip).trim();
                return ClientIp(first_ip.to_string());
            }
        }
        match parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => ClientIp(addr.ip().to_string()),
            None => ClientIp("-".to_string()),
        }
    }
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
