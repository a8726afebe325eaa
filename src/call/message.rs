//! SIP messages for one dialog: the INVITE and the requests derived from it.

use super::CallConfig;
use anyhow::{anyhow, Result};
use rsip::{
    headers::{self, UntypedHeader},
    prelude::HeadersExt,
    Header, Method, Request, Response,
};
use rsipstack::rsip_ext::RsipHeadersExt;
use uuid::Uuid;

const MAX_FORWARDS: &str = "70";

/// The dialog as the cleanup hook needs to see it: the INVITE as last sent and,
/// once answered, the remote `To` carrying the callee's tag.
#[derive(Debug, Clone)]
pub struct DialogSnapshot {
    pub request: Request,
    pub remote_to: Option<headers::To>,
}

impl DialogSnapshot {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            remote_to: None,
        }
    }

    pub fn cancel(&self) -> Result<Request> {
        build_cancel(&self.request)
    }

    pub fn bye(&self) -> Result<Request> {
        build_bye(&self.request, self.remote_to.as_ref())
    }
}

pub fn destination_uri(config: &CallConfig) -> Result<rsip::Uri> {
    rsip::Uri::try_from(format!("sip:{}@{}", config.destination, config.domain))
        .map_err(|e| anyhow!("invalid destination {}: {}", config.destination, e))
}

fn make_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Builds the INVITE. The Via header is left to the transport, which knows the
/// local address the request leaves from.
pub fn build_invite(config: &CallConfig, contact_host: &str) -> Result<Request> {
    let uri = destination_uri(config)?;
    let mut header_list: Vec<Header> = vec![
        Header::MaxForwards(headers::MaxForwards::new(MAX_FORWARDS)),
        Header::From(headers::From::new(format!(
            "<sip:{}@{}>;tag={}",
            config.username,
            config.domain,
            make_tag()
        ))),
        Header::To(headers::To::new(format!(
            "<sip:{}@{}>",
            config.destination, config.domain
        ))),
        Header::CallId(headers::CallId::new(format!(
            "{}@{}",
            Uuid::new_v4(),
            config.domain
        ))),
        Header::CSeq(headers::CSeq::new(format!("1 {}", Method::Invite))),
        Header::Contact(headers::Contact::new(format!(
            "<sip:{}@{}>",
            config.username, contact_host
        ))),
    ];
    if let Some(ref identity) = config.asserted_identity {
        header_list.push(Header::Other(
            "P-Asserted-Identity".to_string(),
            identity.clone(),
        ));
    }
    if let Some(ref useragent) = config.useragent {
        header_list.push(Header::UserAgent(headers::UserAgent::new(useragent.clone())));
    }
    header_list.push(Header::ContentLength(headers::ContentLength::new("0")));

    Ok(Request {
        method: Method::Invite,
        uri,
        version: rsip::Version::V2,
        headers: header_list.into(),
        body: vec![],
    })
}

pub fn cseq_of(request: &Request) -> Result<u32> {
    Ok(request.cseq_header()?.seq()?)
}

/// Clones the dialog identifiers (From, To, Call-ID) of `request` into a new
/// request of another method.
fn in_dialog(
    request: &Request,
    method: Method,
    seq: u32,
    remote_to: Option<&headers::To>,
) -> Result<Request> {
    let to = match remote_to {
        Some(to) => to.clone(),
        None => request.to_header()?.clone(),
    };
    let header_list: Vec<Header> = vec![
        Header::MaxForwards(headers::MaxForwards::new(MAX_FORWARDS)),
        Header::From(request.from_header()?.clone()),
        Header::To(to),
        Header::CallId(request.call_id_header()?.clone()),
        Header::CSeq(headers::CSeq::new(format!("{} {}", seq, method))),
        Header::ContentLength(headers::ContentLength::new("0")),
    ];
    Ok(Request {
        method,
        uri: request.uri.clone(),
        version: rsip::Version::V2,
        headers: header_list.into(),
        body: vec![],
    })
}

/// CANCEL keeps the INVITE's sequence number and top Via so it matches the
/// pending transaction.
pub fn build_cancel(request: &Request) -> Result<Request> {
    let mut cancel = in_dialog(request, Method::Cancel, cseq_of(request)?, None)?;
    if let Ok(via) = request.via_header() {
        cancel.headers.push_front(Header::Via(via.clone()));
    }
    Ok(cancel)
}

pub fn build_bye(request: &Request, remote_to: Option<&headers::To>) -> Result<Request> {
    in_dialog(request, Method::Bye, cseq_of(request)? + 1, remote_to)
}

/// ACK for a 2xx: same sequence number as the INVITE, `To` taken from the answer.
pub fn build_ack(request: &Request, response: &Response) -> Result<Request> {
    let remote_to = response.to_header().ok();
    in_dialog(request, Method::Ack, cseq_of(request)?, remote_to)
}
