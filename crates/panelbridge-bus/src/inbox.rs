//! Relay inbox: one-off messages from page and panel contexts.
//!
//! A message is a JSON frame plus the sender's identity and a reply slot the
//! relay answers at most once. Nothing is shared between the contexts but
//! the encoded text.

use panelbridge_core::{Error, FeatureEvent, Result, WindowId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::pages::PageContextId;

/// Where a message came from, as far as the relay can tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageSender {
    pub tab: Option<PageContextId>,
    pub window: Option<WindowId>,
}

pub struct RelayMessage {
    pub frame: String,
    pub sender: MessageSender,
    reply: oneshot::Sender<String>,
}

impl RelayMessage {
    pub fn event(&self) -> Result<FeatureEvent> {
        FeatureEvent::from_frame(&self.frame)
    }

    /// Encode `answer` and hand it back to the sender.
    pub fn respond<T: Serialize>(self, answer: &T) -> Result<()> {
        let frame = serde_json::to_string(answer)?;
        if self.reply.send(frame).is_err() {
            debug!("Message sender stopped waiting for its reply");
        }
        Ok(())
    }

    /// Drop the message unanswered; the sender sees a closed channel.
    pub fn ignore(self) {}
}

/// Sending half of the relay inbox. Clone one into every context.
#[derive(Clone)]
pub struct RelayInbox {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl RelayInbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Send one message and wait for the relay's answer frame.
    pub async fn send(&self, event: &FeatureEvent, sender: MessageSender) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RelayMessage {
                frame: event.to_frame()?,
                sender,
                reply: reply_tx,
            })
            .map_err(|_| Error::ChannelClosed("relay inbox".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::ChannelClosed(format!("relay did not answer {}", event.kind)))
    }

    /// [`send`](Self::send), decoding the answer into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        event: &FeatureEvent,
        sender: MessageSender,
    ) -> Result<T> {
        let frame = self.send(event, sender).await?;
        Ok(serde_json::from_str(&frame)?)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panelbridge_core::MessageReply;
    use serde_json::json;

    #[tokio::test]
    async fn test_message_round_trip_carries_sender() {
        let (inbox, mut messages) = RelayInbox::channel();
        let relay = tokio::spawn(async move {
            let message = messages.recv().await.unwrap();
            assert!(message.event().unwrap().is("PING"));
            assert_eq!(message.sender.window, Some(WindowId(3)));
            message
                .respond(&MessageReply { ok: true, reason: None })
                .unwrap();
        });

        let sender = MessageSender {
            tab: Some(PageContextId(1)),
            window: Some(WindowId(3)),
        };
        let reply: MessageReply = inbox
            .request(&FeatureEvent::from_value("PING", json!({"n": 1})), sender)
            .await
            .unwrap();
        assert!(reply.ok);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_and_closed_inbox() {
        let (inbox, mut messages) = RelayInbox::channel();
        let relay = tokio::spawn(async move {
            messages.recv().await.unwrap().ignore();
        });
        let event = FeatureEvent::from_value("PING", json!(null));
        let err = inbox.send(&event, MessageSender::default()).await;
        assert!(matches!(err, Err(Error::ChannelClosed(_))));
        relay.await.unwrap();

        assert!(inbox.is_closed());
        assert!(inbox.send(&event, MessageSender::default()).await.is_err());
    }
}
