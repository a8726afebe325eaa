use super::clientip::ClientIp;
use axum::{
    body::Body,
    http::{header::CONTENT_LENGTH, Request},
    middleware::Next,
    response::Response,
};
use std::fmt::Write as _;
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{info, Subscriber};
use tracing_subscriber::fmt::format::{self, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

pub const ACCESS_TARGET: &str = "http.access";

/// Renders `http.access` events as one pipe-separated line and everything else
/// with the default formatter.
#[derive(Clone, Default)]
pub struct AccessLogEventFormat<T = SystemTime> {
    timer: T,
}

impl<T: FormatTime> AccessLogEventFormat<T> {
    pub fn new(timer: T) -> Self {
        Self { timer }
    }
}

#[derive(Default)]
struct AccessLine {
    client_ip: String,
    method: String,
    status: String,
    body_len: String,
    cost_ms: String,
    uri: String,
}

impl Visit for AccessLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        let slot = match field.name() {
            "client_ip" => &mut self.client_ip,
            "method" => &mut self.method,
            "body_len" => &mut self.body_len,
            "uri" => &mut self.uri,
            _ => return,
        };
        *slot = value.to_string();
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "status" {
            self.status = value.to_string();
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == "cost_ms" {
            self.cost_ms = format!("{value:.3}ms");
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut rendered = String::new();
        let _ = write!(rendered, "{value:?}");
        self.record_str(field, rendered.trim_matches('"'));
    }
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

impl<S, N, T> FormatEvent<S, N> for AccessLogEventFormat<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
    T: FormatTime + Clone,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        if metadata.target() != ACCESS_TARGET {
            return format::Format::default()
                .with_timer(self.timer.clone())
                .with_target(true)
                .format_event(ctx, writer, event);
        }
        let mut line = AccessLine::default();
        event.record(&mut line);
        self.timer.format_time(&mut writer)?;
        writeln!(
            writer,
            " {} {} | {} | {} | {} | {} | {} | {}",
            metadata.level(),
            ACCESS_TARGET,
            or_dash(&line.client_ip),
            or_dash(&line.method),
            or_dash(&line.status),
            or_dash(&line.body_len),
            or_dash(&line.cost_ms),
            or_dash(&line.uri),
        )
    }
}

/// Logs one access line per request once the handler returns. Websocket
/// upgrades are logged when the 101 goes out, not when the socket closes.
pub async fn log_requests(client_ip: ClientIp, req: Request<Body>, next: Next) -> Response {
    let started_at = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();

    let response = next.run(req).await;

    let body_len = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let cost_ms = started_at.elapsed().as_secs_f64() * 1_000.0;
    let client_ip = client_ip.to_string();

    info!(
        target: "http.access",
        method = method.as_str(),
        status = response.status().as_u16(),
        body_len = body_len.as_str(),
        cost_ms = cost_ms,
        uri = uri.as_str(),
        client_ip = client_ip.as_str(),
    );

    response
}
