use crate::app::{create_router, AppState, AppStateBuilder};
use crate::call::tests::{ScriptedTransport, Step};
use crate::config::Config;
use anyhow::Result;
use futures::StreamExt;
use rsip::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, protocol::CloseFrame, Message,
};

fn test_config() -> Config {
    let mut config = Config::default();
    config.sip.username = "1234".to_string();
    config.sip.password = "secret".to_string();
    config.sip.domain = "sip.example.com".to_string();
    config.sip.destination = "15550100".to_string();
    config.ua.external_ip = Some("203.0.113.7".to_string());
    config.call_token = Some("letmein".to_string());
    config.timers.provisional_timeout_ms = 500;
    config.timers.call_duration_ms = 300;
    config.timers.cleanup_linger_ms = 50;
    config
}

async fn start_server(transport: Arc<ScriptedTransport>) -> Result<(SocketAddr, AppState)> {
    let state = AppStateBuilder::new()
        .with_config(test_config())
        .with_transport(transport)
        .build()
        .await?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });
    Ok((addr, state))
}

/// Reads until the server closes: the status values in order and the close frame.
async fn collect<S>(ws: &mut S) -> Result<(Vec<String>, Option<CloseFrame>)>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut statuses = vec![];
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str())?;
                statuses.push(value["status"].as_str().unwrap_or_default().to_string());
            }
            Message::Close(frame) => return Ok((statuses, frame)),
            _ => {}
        }
    }
    Ok((statuses, None))
}

#[tokio::test]
async fn test_wrong_token_is_rejected() -> Result<()> {
    let transport = ScriptedTransport::new(vec![]);
    let (addr, _state) = start_server(transport.clone()).await?;

    let url = format!("ws://{}/call?token=nope", addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (statuses, frame) = collect(&mut ws).await?;

    assert!(statuses.is_empty());
    let frame = frame.expect("close frame");
    assert_eq!(u16::from(frame.code), 4001);
    assert_eq!(frame.reason.as_str(), "Wrong credentials");
    assert!(transport.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_call_statuses_are_relayed() -> Result<()> {
    let transport = ScriptedTransport::new(vec![vec![
        (20, Step::Respond(180)),
        (50, Step::Respond(200)),
    ]]);
    let (addr, _state) = start_server(transport.clone()).await?;

    let mut request = format!("ws://{}/call", addr).into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", HeaderValue::from_static("Token letmein"));
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (statuses, frame) = collect(&mut ws).await?;

    assert_eq!(statuses, vec!["sending_invite", "trying", "hanging_up_timer"]);
    assert_eq!(u16::from(frame.expect("close frame").code), 1000);
    assert_eq!(transport.written(Method::Ack).len(), 1);
    assert_eq!(transport.written(Method::Bye).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_rejected_call_reports_error() -> Result<()> {
    let transport = ScriptedTransport::new(vec![vec![(20, Step::Respond(486))]]);
    let (addr, _state) = start_server(transport.clone()).await?;

    let url = format!("ws://{}/call?token=letmein", addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (statuses, frame) = collect(&mut ws).await?;

    assert_eq!(statuses, vec!["sending_invite", "error"]);
    assert_eq!(u16::from(frame.expect("close frame").code), 1000);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_mid_call_sends_cleanup() -> Result<()> {
    let transport = ScriptedTransport::new(vec![vec![(20, Step::Respond(183))]]);
    let (addr, state) = start_server(transport.clone()).await?;

    let url = format!("ws://{}/call?token=letmein", addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    // sending_invite, then trying
    for _ in 0..2 {
        ws.next().await.expect("status frame")?;
    }

    tokio::time::timeout(Duration::from_secs(2), state.shutdown()).await?;
    assert_eq!(transport.written(Method::Cancel).len(), 1);
    assert_eq!(transport.written(Method::Bye).len(), 1);

    let (statuses, frame) = collect(&mut ws).await?;
    assert!(statuses.is_empty());
    assert_eq!(u16::from(frame.expect("close frame").code), 1000);
    Ok(())
}

#[tokio::test]
async fn test_ui_page() -> Result<()> {
    let (addr, _state) = start_server(ScriptedTransport::new(vec![])).await?;
    let resp = reqwest::get(format!("http://{}/ui", addr)).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert!(resp.text().await?.contains("/call"));
    Ok(())
}
