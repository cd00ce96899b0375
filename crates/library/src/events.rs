use std::pin::Pin;
use std::time::Duration;

use common::TrackEvent;
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

pub type EventStream = Pin<Box<dyn Stream<Item = TrackEvent> + Send>>;

/// Anything that can take a lifecycle notification. Never blocks.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: TrackEvent);
}

/// In-process fan-out. Each subscriber gets its own bounded buffer; a
/// subscriber that falls behind loses the oldest events, not the publisher.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<TrackEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        info!("Event publisher ready (buffer {})", capacity.max(1));
        Self { tx }
    }

    /// Live events from now until the stream is dropped.
    pub fn subscribe(&self) -> EventStream {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!("Subscriber lagged; dropped {} events", skipped);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventPublisher {
    fn publish(&self, event: TrackEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Event delivered to {} subscribers", count),
            Err(_) => debug!("Event dropped; no subscribers"),
        }
    }
}

/// Publishes into a server's event endpoint, for workers running out of process.
#[derive(Clone)]
pub struct HttpEventSink {
    client: reqwest::Client,
    url: String,
}

impl HttpEventSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn send(&self, event: &TrackEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl EventSink for HttpEventSink {
    fn publish(&self, event: TrackEvent) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime to publish {:?} event", event.action);
                return;
            }
        };
        let sink = self.clone();
        handle.spawn(async move {
            if let Err(err) = sink.send(&event).await {
                warn!("Failed to publish event to {}: {}", sink.url, err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{EventAction, EventLevel};

    fn event(message: &str) -> TrackEvent {
        TrackEvent::new(EventAction::TrackAdded, EventLevel::Info, message)
    }

    #[tokio::test]
    async fn subscribers_receive_live_events() {
        let publisher = EventPublisher::new(8);
        publisher.publish(event("before anyone listens"));

        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        publisher.publish(event("hello"));
        assert_eq!(first.next().await.unwrap().message, "hello");
        assert_eq!(second.next().await.unwrap().message, "hello");

        drop(second);
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let publisher = EventPublisher::new(2);
        let mut slow = publisher.subscribe();
        for n in 0..5 {
            publisher.publish(event(&format!("event {}", n)));
        }
        assert_eq!(slow.next().await.unwrap().message, "event 3");
        assert_eq!(slow.next().await.unwrap().message, "event 4");
    }
}
