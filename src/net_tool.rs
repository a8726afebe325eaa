use anyhow::{anyhow, Result};
use get_if_addrs::get_if_addrs;
use std::{net::IpAddr, time::Duration};
use tracing::{info, warn};

/// Plain-text "what is my address" services, tried in order.
pub const DEFAULT_LOOKUP_ENDPOINTS: [&str; 3] = [
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://ifconfig.me/ip",
];

/// Longest body accepted from a lookup endpoint.
pub const MAX_ADDRESS_LEN: usize = 64;

pub fn get_first_non_loopback_interface() -> Result<IpAddr> {
    get_if_addrs()?
        .iter()
        .find(|i| !i.is_loopback())
        .map(|i| match i.addr {
            get_if_addrs::IfAddr::V4(ref addr) => Ok(std::net::IpAddr::V4(addr.ip)),
            _ => Err(anyhow::anyhow!("No IPv4 address found")),
        })
        .unwrap_or(Err(anyhow::anyhow!("No interface found")))
}

/// Returns the first non-empty answer among `endpoints`. No retries, no caching.
pub async fn discover_public_ip(endpoints: &[String], timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(crate::version::get_useragent())
        .build()?;
    for url in endpoints {
        match fetch_public_ip_from(&client, url).await {
            Ok(ip) if ip.is_empty() => {
                warn!(url, "public address lookup returned an empty body");
            }
            Ok(ip) => {
                info!(url, ip, "public address discovered");
                if let Ok(addr) = ip.parse::<IpAddr>() {
                    if is_private_ip(&addr) {
                        warn!(ip, "lookup answered with a private address");
                    }
                }
                return Ok(ip);
            }
            Err(e) => warn!(url, "public address lookup failed: {}", e),
        }
    }
    Err(anyhow!("all {} endpoints failed", endpoints.len()))
}

/// One lookup: `200 OK` with a body of at most [`MAX_ADDRESS_LEN`] bytes, trimmed.
pub async fn fetch_public_ip_from(client: &reqwest::Client, url: &str) -> Result<String> {
    let mut resp = client.get(url).send().await?;
    if resp.status() != reqwest::StatusCode::OK {
        return Err(anyhow!("HTTP {}", resp.status()));
    }
    let mut body = Vec::with_capacity(MAX_ADDRESS_LEN);
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > MAX_ADDRESS_LEN {
            return Err(anyhow!("response exceeds {} bytes", MAX_ADDRESS_LEN));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8(body)?.trim().to_string())
}

/// Check if an IP address is private (RFC 1918, RFC 4193, loopback, etc.)
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();
            // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
            octets[0] == 10
                || (octets[0] == 172 && (octets[1] & 0xf0) == 16)
                || (octets[0] == 192 && octets[1] == 168)
                || ipv4.is_loopback()
                || ipv4.is_link_local()
        }
        IpAddr::V6(ipv6) => {
            // fc00::/7 and fe80::/10
            (ipv6.octets()[0] & 0xfe) == 0xfc
                || ipv6.is_loopback()
                || (ipv6.octets()[0] == 0xfe && (ipv6.octets()[1] & 0xc0) == 0x80)
        }
    }
}
