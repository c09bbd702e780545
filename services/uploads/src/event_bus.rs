use crate::metadata_store::FileRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Topic carrying [`UploadEvent`]s
pub const FILE_UPLOADED_TOPIC: &str = "fileUploaded";

/// Published once per successfully committed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    #[serde(rename = "fileUploaded")]
    pub file: FileRecord,
    #[serde(rename = "userId")]
    pub owner_id: i32,
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Event bus closed, cannot use topic {topic}")]
    Closed { topic: String },
}

/// Publishing side of the bus as seen by the ingestion pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns the number of subscribers the event was handed to
    async fn publish(&self, topic: &str, event: UploadEvent) -> Result<usize, EventBusError>;
}

/// Broadcast-backed bus with lazily created topics
pub struct InProcEventBus<T> {
    topics: RwLock<HashMap<String, broadcast::Sender<T>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> InProcEventBus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<T>, EventBusError> {
        let closed = || EventBusError::Closed {
            topic: topic.to_string(),
        };

        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }

        {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            if let Some(sender) = topics.get(topic) {
                return Ok(sender.clone());
            }
        }

        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        // close() may have won the race for the write lock
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }

    /// Hand `payload` to every current subscriber of `topic`
    pub fn send(&self, topic: &str, payload: T) -> Result<usize, EventBusError> {
        let sender = self.sender(topic)?;
        // No subscribers is not an error; the event is simply dropped.
        Ok(sender.send(payload).unwrap_or(0))
    }

    /// Independent cursor over `topic`, starting now.
    ///
    /// A subscriber that falls more than the channel capacity behind skips the
    /// events it missed. The stream ends when the bus is closed.
    pub fn subscribe(
        &self,
        topic: &str,
    ) -> Result<impl Stream<Item = T> + Send + Unpin + 'static, EventBusError> {
        let receiver = self.sender(topic)?.subscribe();
        let topic = topic.to_string();

        debug!(topic = %topic, "New event subscription");

        Ok(BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(payload) => Some(payload),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "Subscriber lagged, events dropped");
                None
            }
        }))
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop every topic. Live subscriptions end and later calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus<UploadEvent> {
    async fn publish(&self, topic: &str, event: UploadEvent) -> Result<usize, EventBusError> {
        self.send(topic, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next<S: Stream<Item = u32> + Unpin>(stream: &mut S) -> Option<u32> {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = InProcEventBus::<u32>::new(8);
        assert_eq!(bus.send("topic", 1).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_event() {
        let bus = InProcEventBus::<u32>::new(8);
        let mut first = bus.subscribe("topic").unwrap();
        let mut second = bus.subscribe("topic").unwrap();

        assert_eq!(bus.subscriber_count("topic"), 2);
        assert_eq!(bus.send("topic", 1).unwrap(), 2);
        assert_eq!(bus.send("topic", 2).unwrap(), 2);

        assert_eq!(next(&mut first).await, Some(1));
        assert_eq!(next(&mut first).await, Some(2));
        assert_eq!(next(&mut second).await, Some(1));
        assert_eq!(next(&mut second).await, Some(2));
    }

    #[tokio::test]
    async fn test_subscription_does_not_replay_past_events() {
        let bus = InProcEventBus::<u32>::new(8);
        let _early = bus.subscribe("topic").unwrap();
        bus.send("topic", 1).unwrap();

        let mut late = bus.subscribe("topic").unwrap();
        bus.send("topic", 2).unwrap();

        assert_eq!(next(&mut late).await, Some(2));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = InProcEventBus::<u32>::new(8);
        let mut uploads = bus.subscribe("uploads").unwrap();

        assert_eq!(bus.send("other", 1).unwrap(), 0);
        bus.send("uploads", 2).unwrap();

        assert_eq!(next(&mut uploads).await, Some(2));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_missed_events() {
        let bus = InProcEventBus::<u32>::new(2);
        let mut slow = bus.subscribe("topic").unwrap();

        for n in 1..=4 {
            bus.send("topic", n).unwrap();
        }

        assert_eq!(next(&mut slow).await, Some(3));
        assert_eq!(next(&mut slow).await, Some(4));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_publish() {
        let bus = InProcEventBus::<u32>::new(8);
        let mut stream = bus.subscribe("topic").unwrap();

        bus.close();

        assert_eq!(next(&mut stream).await, None);
        assert!(matches!(
            bus.send("topic", 1),
            Err(EventBusError::Closed { .. })
        ));
        assert!(bus.subscribe("topic").is_err());
    }

    #[tokio::test]
    async fn test_upload_event_publisher() {
        let bus = InProcEventBus::<UploadEvent>::new(8);
        let mut stream = bus.subscribe(FILE_UPLOADED_TOPIC).unwrap();
        let now = Utc::now();
        let event = UploadEvent {
            file: FileRecord {
                id: 1,
                owner_id: 1,
                display_name: "hello".to_string(),
                storage_key: "1-hello".to_string(),
                size_bytes: 5,
                content_type: "text/plain".to_string(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
            owner_id: 1,
        };

        let delivered = bus.publish(FILE_UPLOADED_TOPIC, event.clone()).await.unwrap();
        assert_eq!(delivered, 1);

        let received = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);

        let json = serde_json::to_value(&received).unwrap();
        assert_eq!(json["userId"], 1);
        assert_eq!(json["fileUploaded"]["fileName"], "hello");
    }
}
