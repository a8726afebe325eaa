//! A scripted `SessionTransport`: each `send` consumes the next script of timed
//! responses, every request that leaves is recorded with the instant it left.

use crate::call::SipCredential;
use crate::useragent::{ResponseStream, SessionTransport};
use anyhow::Result;
use async_trait::async_trait;
use rsip::{
    headers::{self, UntypedHeader},
    prelude::HeadersExt,
    Header, Method, Request, Response,
};
use rsipstack::rsip_ext::RsipHeadersExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};


#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Respond(u16),
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub at: Instant,
    pub request: Request,
    /// Sent through `send`/`send_authenticated` rather than `write`.
    pub tracked: bool,
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<(Duration, Step)>>>,
    sent: Mutex<Vec<Sent>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    branch: AtomicUsize,
}

impl ScriptedTransport {
    /// One script per tracked send, offsets in milliseconds from that send.
    pub fn new(scripts: Vec<Vec<(u64, Step)>>) -> Arc<Self> {
        let scripts = scripts
            .into_iter()
            .map(|s| {
                s.into_iter()
                    .map(|(ms, step)| (Duration::from_millis(ms), step))
                    .collect()
            })
            .collect();
        Arc::new(Self {
            scripts: Mutex::new(scripts),
            ..Default::default()
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn written(&self, method: Method) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| !s.tracked && s.request.method == method)
            .collect()
    }

    pub fn tracked(&self) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.tracked).collect()
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    fn track(&self, mut request: Request) -> Box<dyn ResponseStream> {
        if request.via_header().is_err() {
            let branch = self.branch.fetch_add(1, Ordering::SeqCst);
            request.headers.push_front(Header::Via(headers::Via::new(format!(
                "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest{}",
                branch
            ))));
        }
        let now = Instant::now();
        self.sent.lock().unwrap().push(Sent {
            at: now,
            request: request.clone(),
            tracked: true,
        });
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
            .into_iter()
            .map(|(offset, step)| (now + offset, step))
            .collect();
        Box::new(ScriptedResponses {
            request,
            script,
            guard: Some(LiveGuard::new(self.live.clone(), self.max_live.clone())),
        })
    }
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Box<dyn ResponseStream>> {
        Ok(self.track(request))
    }

    async fn send_authenticated(
        &self,
        request: &Request,
        _challenge: &Response,
        credential: &SipCredential,
    ) -> Result<Box<dyn ResponseStream>> {
        let seq = request.cseq_header()?.seq()? + 1;
        let mut header_list: Vec<Header> = request
            .headers
            .iter()
            .filter(|h| !matches!(h, Header::Via(_)))
            .map(|h| match h {
                Header::CSeq(_) => {
                    Header::CSeq(headers::CSeq::new(format!("{} {}", seq, request.method)))
                }
                other => other.clone(),
            })
            .collect();
        header_list.push(Header::Other(
            "Authorization".to_string(),
            format!("Digest username=\"{}\"", credential.username),
        ));
        let mut resent = request.clone();
        resent.headers = header_list.into();
        Ok(self.track(resent))
    }

    async fn write(&self, request: Request) -> Result<()> {
        self.sent.lock().unwrap().push(Sent {
            at: Instant::now(),
            request,
            tracked: false,
        });
        Ok(())
    }
}

struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>, max_live: Arc<AtomicUsize>) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        max_live.fetch_max(now, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedResponses {
    request: Request,
    script: VecDeque<(Instant, Step)>,
    guard: Option<LiveGuard>,
}

#[async_trait]
impl ResponseStream for ScriptedResponses {
    fn request(&self) -> &Request {
        &self.request
    }

    async fn next_response(&mut self) -> Option<Response> {
        if self.guard.is_none() {
            return None;
        }
        let Some((at, _)) = self.script.front() else {
            return std::future::pending().await;
        };
        sleep_until(*at).await;
        match self.script.pop_front()?.1 {
            Step::Respond(code) => Some(response_for(&self.request, code)),
            Step::Close => {
                self.script.clear();
                self.guard = None;
                None
            }
        }
    }

    fn retire(&mut self) {
        self.guard = None;
    }
}

/// A response the way a callee would send it: dialog headers echoed back and a
/// remote tag on anything past 100.
pub(crate) fn response_for(request: &Request, code: u16) -> Response {
    let mut header_list: Vec<Header> = vec![];
    if let Ok(via) = request.via_header() {
        header_list.push(Header::Via(via.clone()));
    }
    if let Ok(from) = request.from_header() {
        header_list.push(Header::From(from.clone()));
    }
    if let Ok(to) = request.to_header() {
        let to = if code > 100 {
            headers::To::new(format!("{};tag=callee", to.value()))
        } else {
            to.clone()
        };
        header_list.push(Header::To(to));
    }
    if let Ok(call_id) = request.call_id_header() {
        header_list.push(Header::CallId(call_id.clone()));
    }
    if let Ok(cseq) = request.cseq_header() {
        header_list.push(Header::CSeq(cseq.clone()));
    }
    header_list.push(Header::ContentLength(headers::ContentLength::new("0")));
    Response {
        status_code: rsip::StatusCode::from(code),
        version: rsip::Version::V2,
        headers: header_list.into(),
        body: vec![],
    }
}
