use std::{
    borrow::Cow,
    collections::{HashMap, VecDeque},
    fmt,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, ScanError};

/// One locked message handed out by a [`MessageSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    /// Transport-specific handle used to settle this delivery.
    pub receipt: String,
}

impl InboundMessage {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Peek-lock style subscription: a received message stays invisible to other
/// receivers until it is completed (removed) or abandoned (redelivered).
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Next message, or `None` when the subscription is currently empty.
    async fn receive(&self) -> Result<Option<InboundMessage>>;

    async fn complete(&self, message: &InboundMessage) -> Result<()>;

    async fn abandon(&self, message: &InboundMessage) -> Result<()>;

    /// Extend the lock on a message that is still being handled.
    async fn renew(&self, message: &InboundMessage) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    ready: VecDeque<InboundMessage>,
    locked: HashMap<String, InboundMessage>,
    completed: Vec<InboundMessage>,
    dead_lettered: Vec<InboundMessage>,
}

/// Process-local subscription used by tests and local runs. Mirrors broker
/// semantics closely enough to exercise the loop: locks, redelivery with a
/// growing delivery count, and dead-lettering past `max_deliveries`.
pub struct InMemoryMessageSource {
    state: Mutex<InMemoryState>,
    max_deliveries: u32,
}

impl fmt::Debug for InMemoryMessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMessageSource")
            .field("max_deliveries", &self.max_deliveries)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryMessageSource {
    fn default() -> Self {
        Self::new(10)
    }
}

impl InMemoryMessageSource {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Enqueue a body; returns the generated message id.
    pub async fn publish(&self, body: impl Into<Vec<u8>>) -> String {
        let message_id = Uuid::now_v7().to_string();
        let mut state = self.state.lock().await;
        state.ready.push_back(InboundMessage {
            message_id: message_id.clone(),
            body: body.into(),
            delivery_count: 0,
            receipt: String::new(),
        });
        message_id
    }

    pub async fn completed(&self) -> Vec<InboundMessage> {
        self.state.lock().await.completed.clone()
    }

    pub async fn dead_lettered(&self) -> Vec<InboundMessage> {
        self.state.lock().await.dead_lettered.clone()
    }

    /// Messages waiting for (re)delivery.
    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages currently locked by a receiver.
    pub async fn locked_count(&self) -> usize {
        self.state.lock().await.locked.len()
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    async fn receive(&self) -> Result<Option<InboundMessage>> {
        let mut state = self.state.lock().await;
        while let Some(mut message) = state.ready.pop_front() {
            if message.delivery_count >= self.max_deliveries {
                warn!(
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    "max delivery count reached; dead-lettering"
                );
                state.dead_lettered.push(message);
                continue;
            }

            message.delivery_count += 1;
            message.receipt = Uuid::now_v7().to_string();
            state.locked.insert(message.receipt.clone(), message.clone());
            return Ok(Some(message));
        }
        Ok(None)
    }

    async fn complete(&self, message: &InboundMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let settled = state
            .locked
            .remove(&message.receipt)
            .ok_or_else(|| lock_lost(message))?;
        state.completed.push(settled);
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        let released = state
            .locked
            .remove(&message.receipt)
            .ok_or_else(|| lock_lost(message))?;
        state.ready.push_back(released);
        Ok(())
    }

    async fn renew(&self, message: &InboundMessage) -> Result<()> {
        let state = self.state.lock().await;
        if state.locked.contains_key(&message.receipt) {
            Ok(())
        } else {
            Err(lock_lost(message))
        }
    }
}

fn lock_lost(message: &InboundMessage) -> ScanError {
    ScanError::Transport(format!(
        "lock for message {} is no longer held",
        message.message_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_messages_leave_the_subscription() {
        let source = InMemoryMessageSource::default();
        let id = source.publish("hello").await;

        let message = source.receive().await.expect("receive").expect("message");
        assert_eq!(message.message_id, id);
        assert_eq!(message.delivery_count, 1);
        assert_eq!(message.body_text(), "hello");
        assert_eq!(source.locked_count().await, 1);

        source.complete(&message).await.expect("complete");
        assert_eq!(source.locked_count().await, 0);
        assert_eq!(source.completed().await.len(), 1);
        assert!(source.receive().await.expect("receive").is_none());
    }

    #[tokio::test]
    async fn abandoned_messages_are_redelivered_until_dead_lettered() {
        let source = InMemoryMessageSource::new(2);
        source.publish("retry me").await;

        let first = source.receive().await.expect("receive").expect("first");
        source.abandon(&first).await.expect("abandon");
        let second = source.receive().await.expect("receive").expect("second");
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.receipt, second.receipt);
        source.abandon(&second).await.expect("abandon");

        assert!(source.receive().await.expect("receive").is_none());
        assert_eq!(source.dead_lettered().await.len(), 1);
    }

    #[tokio::test]
    async fn settling_twice_reports_lost_lock() {
        let source = InMemoryMessageSource::default();
        source.publish("once").await;
        let message = source.receive().await.expect("receive").expect("message");

        source.complete(&message).await.expect("complete");
        assert!(matches!(
            source.complete(&message).await,
            Err(ScanError::Transport(_))
        ));
        assert!(source.abandon(&message).await.is_err());
    }

    #[tokio::test]
    async fn renewal_requires_a_held_lock() {
        let source = InMemoryMessageSource::default();
        source.publish("long running").await;
        let message = source.receive().await.expect("receive").expect("message");

        source.renew(&message).await.expect("renew while locked");
        assert_eq!(source.locked_count().await, 1);

        source.complete(&message).await.expect("complete");
        assert!(matches!(
            source.renew(&message).await,
            Err(ScanError::Transport(_))
        ));
    }
}
