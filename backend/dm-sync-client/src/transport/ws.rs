use async_trait::async_trait;
use event_schema::{ClientFrame, PushEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PushChannel, PushSender, PushSubscription};
use crate::error::TransportError;

/// WebSocket push channel: `GET {base}/ws?thread_id=..&token=..`
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    base_url: String,
    token: String,
}

impl WsPushChannel {
    /// `base_url` is the `ws://` or `wss://` origin of the service
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url_for(&self, thread_id: Uuid) -> String {
        format!(
            "{}/ws?thread_id={}&token={}",
            self.base_url,
            thread_id,
            urlencoding::encode(&self.token)
        )
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn subscribe(&self, thread_id: Uuid) -> Result<PushSubscription, TransportError> {
        let (stream, _) = connect_async(self.url_for(thread_id).as_str())
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        info!(%thread_id, "push channel connected");

        let (mut write, mut read) = stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if let Err(e) = write.send(Message::text(json)).await {
                                    warn!(%thread_id, error = %e, "push write failed");
                                    break;
                                }
                            }
                            Err(e) => warn!(%thread_id, error = %e, "client frame encoding failed"),
                        }
                    }
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match PushEvent::from_json(text.as_str()) {
                            Ok(event) => {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(%thread_id, error = %e, "dropping undecodable push frame")
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%thread_id, error = %e, "push read failed");
                            break;
                        }
                    },
                }
            }
            info!(%thread_id, "push channel closed");
        });

        Ok(PushSubscription::new(
            event_rx,
            PushSender::new(frame_tx),
            cancel_tx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_url_encoded() {
        let channel = WsPushChannel::new("ws://localhost:8085/", "a+b/c=");
        let thread = Uuid::nil();
        assert_eq!(
            channel.url_for(thread),
            format!("ws://localhost:8085/ws?thread_id={thread}&token=a%2Bb%2Fc%3D")
        );
    }
}
