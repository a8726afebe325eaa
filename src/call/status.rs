use super::CallStatus;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub const STATUS_CAPACITY: usize = 16;

pub type StatusReceiver = mpsc::Receiver<CallStatus>;

/// Posts status events without ever waiting on the observer.
///
/// A full buffer drops the newest event: status is telemetry, signaling must not
/// stall behind a slow websocket. Dropping the last sender closes the stream.
#[derive(Debug, Clone, Default)]
pub struct StatusSender {
    tx: Option<mpsc::Sender<CallStatus>>,
}

impl StatusSender {
    pub fn channel() -> (Self, StatusReceiver) {
        let (tx, rx) = mpsc::channel(STATUS_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender with no observer behind it.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, status: CallStatus) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(status) {
            Ok(_) => {}
            Err(TrySendError::Full(status)) => {
                debug!(?status, "status buffer full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_buffer_drops_newest() {
        let (sender, mut rx) = StatusSender::channel();
        for _ in 0..STATUS_CAPACITY {
            sender.send(CallStatus::Trying);
        }
        sender.send(CallStatus::Error);
        drop(sender);

        let mut received = vec![];
        while let Some(status) = rx.recv().await {
            received.push(status);
        }
        assert_eq!(received.len(), STATUS_CAPACITY);
        assert!(received.iter().all(|s| *s == CallStatus::Trying));
    }

    #[tokio::test]
    async fn test_send_without_observer() {
        let (sender, rx) = StatusSender::channel();
        drop(rx);
        sender.send(CallStatus::SendingInvite);
        StatusSender::detached().send(CallStatus::Error);
    }

    #[test]
    fn test_status_json() {
        let msg: crate::call::StatusMessage = CallStatus::HangingUpTimer.into();
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"status":"hanging_up_timer"}"#
        );
        let msg: crate::call::StatusMessage = CallStatus::SendingInvite.into();
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"status":"sending_invite"}"#
        );
    }
}
