use super::{
    classify,
    message::{self, DialogSnapshot},
    CallConfig, CallError, CallOutcome, CallStatus, ResponseClass, StatusSender,
};
use crate::useragent::{ResponseStream, SessionTransport};
use rsip::{headers::UntypedHeader, prelude::HeadersExt, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives one outbound call from INVITE to hangup.
///
/// The run ends in exactly one of: answered and torn down on the timer, torn down
/// unanswered on the timer, cancelled for lack of a provisional response, rejected,
/// out of auth attempts, or interrupted by operator shutdown. Every path that leaves
/// a dialog behind on the remote side sends the matching CANCEL or BYE.
pub struct CallEngine {
    config: Arc<CallConfig>,
    transport: Arc<dyn SessionTransport>,
    contact: String,
    status: StatusSender,
}

/// State of the INVITE in flight. The phase is derived: no `call_deadline` means
/// we are still waiting for a provisional response.
struct CallAttempt {
    responses: Box<dyn ResponseStream>,
    auth_challenges: u32,
    provisional_deadline: Instant,
    call_deadline: Option<Instant>,
    dialog: watch::Sender<DialogSnapshot>,
}

impl CallAttempt {
    fn request(&self) -> &Request {
        self.responses.request()
    }
}

enum Wake {
    Shutdown,
    Deadline,
    Response(Option<Response>),
}

impl CallEngine {
    pub fn new(
        config: Arc<CallConfig>,
        transport: Arc<dyn SessionTransport>,
        contact: impl Into<String>,
        status: StatusSender,
    ) -> Self {
        Self {
            config,
            transport,
            contact: contact.into(),
            status,
        }
    }

    /// Places the call. `shutdown` must only fire on operator request; the run's
    /// own completion never triggers the cleanup hook.
    pub async fn run(self, shutdown: CancellationToken) -> Result<CallOutcome, CallError> {
        let result = self.place(&shutdown).await;
        match result {
            Ok(ref outcome) => info!(?outcome, "call finished"),
            Err(ref e) => warn!("call failed: {}", e),
        }
        result
    }

    fn fail(&self, err: CallError) -> CallError {
        self.status.send(CallStatus::Error);
        err
    }

    async fn place(&self, shutdown: &CancellationToken) -> Result<CallOutcome, CallError> {
        if shutdown.is_cancelled() {
            return Ok(CallOutcome::Interrupted);
        }
        let invite = message::build_invite(&self.config, &self.contact)
            .map_err(|e| self.fail(e.into()))?;
        let call_id = invite
            .call_id_header()
            .map(|h| h.value().to_string())
            .unwrap_or_default();

        self.status.send(CallStatus::SendingInvite);
        info!(
            call_id,
            destination = self.config.destination,
            domain = self.config.domain,
            "dialing"
        );
        let responses = self
            .transport
            .send(invite)
            .await
            .map_err(|e| self.fail(e.into()))?;

        let (dialog_tx, dialog_rx) =
            watch::channel(DialogSnapshot::new(responses.request().clone()));
        let finished = CancellationToken::new();
        let cleanup = tokio::spawn(cleanup_hook(
            self.transport.clone(),
            dialog_rx,
            shutdown.clone(),
            finished.clone(),
            self.config.timings.cleanup_linger,
        ));

        let attempt = CallAttempt {
            responses,
            auth_challenges: 0,
            provisional_deadline: Instant::now() + self.config.timings.provisional_timeout,
            call_deadline: None,
            dialog: dialog_tx,
        };
        let result = self.drive(attempt, shutdown).await;

        finished.cancel();
        if let Err(e) = cleanup.await {
            warn!("cleanup hook failed: {}", e);
        }
        result
    }

    async fn drive(
        &self,
        mut attempt: CallAttempt,
        shutdown: &CancellationToken,
    ) -> Result<CallOutcome, CallError> {
        let timings = self.config.timings;
        loop {
            // once a call deadline exists it takes precedence over the provisional wait
            let deadline = attempt
                .call_deadline
                .unwrap_or(attempt.provisional_deadline);

            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = sleep_until(deadline) => Wake::Deadline,
                response = attempt.responses.next_response() => Wake::Response(response),
            };

            let response = match wake {
                Wake::Shutdown => {
                    info!("shutdown requested while the call was pending");
                    return Ok(CallOutcome::Interrupted);
                }
                Wake::Deadline if attempt.call_deadline.is_some() => {
                    info!("call duration elapsed before answer, sending BYE");
                    self.status.send(CallStatus::HangingUpTimer);
                    self.teardown(&attempt.dialog).await;
                    return Ok(CallOutcome::Unanswered);
                }
                Wake::Deadline => {
                    warn!(
                        "no provisional response within {:?}, sending CANCEL",
                        timings.provisional_timeout
                    );
                    self.status.send(CallStatus::Error);
                    // CANCEL matches the INVITE transaction, which must let go first
                    attempt.responses.retire();
                    self.abort(&attempt.dialog).await;
                    return Err(CallError::ProvisionalTimeout(timings.provisional_timeout));
                }
                Wake::Response(None) => return Err(self.fail(CallError::StreamClosed)),
                Wake::Response(Some(response)) => response,
            };

            info!(status = %response.status_code, "received response");
            match classify(&response) {
                ResponseClass::Provisional(code) => {
                    if attempt.call_deadline.is_some() {
                        debug!(code, "provisional response ignored, timer already running");
                        continue;
                    }
                    self.status.send(CallStatus::Trying);
                    attempt.call_deadline = Some(Instant::now() + timings.call_duration);
                    info!(
                        code,
                        bye_at = wall_clock_after(timings.call_duration),
                        "call timer started"
                    );
                }
                ResponseClass::Success(_) => {
                    let deadline = *attempt
                        .call_deadline
                        .get_or_insert_with(|| Instant::now() + timings.call_duration);
                    let (request, dialog) = (attempt.responses.request(), &attempt.dialog);
                    return self
                        .established(request, dialog, &response, deadline, shutdown)
                        .await;
                }
                ResponseClass::Challenge(_) => {
                    if let Some(outcome) =
                        self.authenticate(&mut attempt, &response, shutdown).await?
                    {
                        return Ok(outcome);
                    }
                }
                ResponseClass::Failure(code) => {
                    return Err(self.fail(CallError::Rejected {
                        code,
                        reason: response.status_code.to_string(),
                    }));
                }
            }
        }
    }

    /// Resends the INVITE with credentials. `Some` ends the run: shutdown came
    /// while the resend was in flight.
    async fn authenticate(
        &self,
        attempt: &mut CallAttempt,
        challenge: &Response,
        shutdown: &CancellationToken,
    ) -> Result<Option<CallOutcome>, CallError> {
        attempt.auth_challenges += 1;
        let max = self.config.timings.max_auth_attempts;
        info!(attempt = attempt.auth_challenges, max, "auth challenge");
        if attempt.auth_challenges > max {
            // the challenge is a final response, nothing is left pending to cancel
            return Err(self.fail(CallError::AuthExhausted(attempt.auth_challenges)));
        }
        self.status.send(CallStatus::Authenticating);

        let request = attempt.request().clone();
        attempt.responses.retire();
        let resend = self
            .transport
            .send_authenticated(&request, challenge, &self.config.credential);
        let responses = tokio::select! {
            biased;
            result = resend => result.map_err(|e| self.fail(e.into()))?,
            _ = shutdown.cancelled() => {
                info!("shutdown requested during the auth resend");
                return Ok(Some(CallOutcome::Interrupted));
            }
        };

        if shutdown.is_cancelled() {
            // the cleanup hook only knows the challenged request
            let cancel = message::build_cancel(responses.request());
            drop(responses);
            send_one_off(self.transport.as_ref(), cancel, "CANCEL").await;
            return Ok(Some(CallOutcome::Interrupted));
        }
        attempt
            .dialog
            .send_replace(DialogSnapshot::new(responses.request().clone()));
        attempt.responses = responses;
        if attempt.call_deadline.is_none() {
            attempt.provisional_deadline =
                Instant::now() + self.config.timings.provisional_timeout;
        }
        Ok(None)
    }

    async fn established(
        &self,
        request: &Request,
        dialog: &watch::Sender<DialogSnapshot>,
        response: &Response,
        deadline: Instant,
        shutdown: &CancellationToken,
    ) -> Result<CallOutcome, CallError> {
        let remote_to = response.to_header().ok().cloned();
        dialog.send_modify(|d| d.remote_to = remote_to);

        info!("call established, sending ACK");
        match message::build_ack(request, response) {
            Ok(ack) => {
                if let Err(e) = self.transport.write(ack).await {
                    warn!("failed to send ACK: {}", e);
                }
            }
            Err(e) => warn!("failed to build ACK: {}", e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested during the call");
                return Ok(CallOutcome::Interrupted);
            }
            _ = sleep_until(deadline) => {}
        }
        self.status.send(CallStatus::HangingUpTimer);
        self.teardown(dialog).await;
        Ok(CallOutcome::Completed)
    }

    async fn abort(&self, dialog: &watch::Sender<DialogSnapshot>) {
        let cancel = dialog.borrow().cancel();
        send_one_off(self.transport.as_ref(), cancel, "CANCEL").await;
    }

    async fn teardown(&self, dialog: &watch::Sender<DialogSnapshot>) {
        let bye = dialog.borrow().bye();
        send_one_off(self.transport.as_ref(), bye, "BYE").await;
    }
}

async fn send_one_off(
    transport: &dyn SessionTransport,
    request: anyhow::Result<Request>,
    what: &str,
) {
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!("failed to build {}: {}", what, e);
            return;
        }
    };
    match transport.write(request).await {
        Ok(_) => info!("{} sent", what),
        Err(e) => warn!("failed to send {}: {}", what, e),
    }
}

/// Sends CANCEL then BYE for the current dialog when the operator shuts down.
/// Exits quietly when `finished` fires first.
async fn cleanup_hook(
    transport: Arc<dyn SessionTransport>,
    dialog: watch::Receiver<DialogSnapshot>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    linger: Duration,
) {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {}
        _ = finished.cancelled() => return,
    }
    warn!("interrupted, sending forced CANCEL and BYE");
    let snapshot = dialog.borrow().clone();
    send_one_off(transport.as_ref(), snapshot.cancel(), "CANCEL").await;
    send_one_off(transport.as_ref(), snapshot.bye(), "BYE").await;
    sleep(linger).await;
    info!("cleanup sent");
}

fn wall_clock_after(d: Duration) -> String {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| chrono::Local::now().checked_add_signed(d))
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
