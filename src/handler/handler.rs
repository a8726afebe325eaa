use super::middleware::clientip::ClientIp;
use crate::app::AppState;
use crate::call::{StatusMessage, StatusReceiver, StatusSender};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub const WRONG_CREDENTIALS: u16 = 4001;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ui", get(ui_handler))
        .route("/call", get(call_handler))
}

async fn ui_handler() -> Html<&'static str> {
    Html(include_str!("../../static/ui.html"))
}

#[derive(Debug, Default, Deserialize)]
pub struct CallParams {
    pub token: Option<String>,
}

/// `Authorization: Token <value>` wins over `?token=`.
fn presented_token(headers: &HeaderMap, params: &CallParams) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Token "))
        .map(|v| v.trim().to_string())
        .or_else(|| params.token.clone())
        .unwrap_or_default()
}

pub async fn call_handler(
    client_ip: ClientIp,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<CallParams>,
    headers: HeaderMap,
) -> Response {
    let authorized = presented_token(&headers, &params) == state.config.expected_token();
    info!(%client_ip, authorized, "call requested");
    ws.on_upgrade(move |socket| async move {
        if authorized {
            relay_call(socket, state, client_ip).await;
        } else {
            reject(socket).await;
        }
    })
    .into_response()
}

async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: WRONG_CREDENTIALS,
        reason: "Wrong credentials".into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("failed to send close frame: {}", e);
    }
}

/// Starts one call and forwards its status events until the call ends. A client
/// that goes away stops the relay, not the call.
async fn relay_call(socket: WebSocket, state: AppState, client_ip: ClientIp) {
    let (status, events) = StatusSender::channel();
    let call_state = state.clone();
    state.tasks.spawn(async move {
        if let Err(e) = call_state.place_call(status).await {
            debug!("call ended with error: {}", e);
        }
    });

    let (mut sender, mut receiver) = socket.split();
    let observer_left = tokio::select! {
        _ = forward(&mut sender, events) => false,
        _ = async {
            while let Some(Ok(msg)) = receiver.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        } => true,
    };

    if observer_left {
        info!(%client_ip, "observer left, call continues");
        return;
    }
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: "call finished".into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        debug!("failed to send close frame: {}", e);
    }
}

async fn forward(sender: &mut SplitSink<WebSocket, Message>, mut events: StatusReceiver) {
    while let Some(status) = events.recv().await {
        let message = match serde_json::to_string(&StatusMessage::from(status)) {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to encode status: {}", e);
                continue;
            }
        };
        if let Err(e) = sender.send(Message::Text(message.into())).await {
            debug!("status {:?} not delivered: {}", status, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presented_token() {
        let mut headers = HeaderMap::new();
        let params = CallParams {
            token: Some("from-query".to_string()),
        };
        assert_eq!(presented_token(&headers, &params), "from-query");

        headers.insert(AUTHORIZATION, "Token from-header".parse().unwrap());
        assert_eq!(presented_token(&headers, &params), "from-header");

        headers.insert(AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert_eq!(presented_token(&headers, &CallParams::default()), "");
    }
}
