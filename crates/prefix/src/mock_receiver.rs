//! Manually driven receiver for tests.

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv6Net;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::ReceiverError;
use crate::types::{
    classify_update, Event, EventType, Prefix, Receiver, Source, EVENT_CHANNEL_CAPACITY,
};

/// A receiver whose prefix lifecycle is driven by the test.
pub struct MockReceiver {
    source: Source,
    current: RwLock<Option<Prefix>>,
    events: broadcast::Sender<Event>,
    started: Mutex<bool>,
}

impl MockReceiver {
    pub fn new(source: Source) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            current: RwLock::new(None),
            events,
            started: Mutex::new(false),
        }
    }

    /// Simulate receiving a prefix, emitting the classifying event.
    pub fn simulate_prefix(&self, network: Ipv6Net, valid_lifetime: Duration) {
        let prefix = Prefix {
            network,
            valid_lifetime,
            preferred_lifetime: valid_lifetime,
            source: self.source,
            received_at: Utc::now(),
        };

        let event_type = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            let event_type = classify_update(current.as_ref(), network);
            *current = Some(prefix.clone());
            event_type
        };

        let _ = self.events.send(Event::new(event_type, Some(prefix)));
    }

    /// Simulate lease expiry: clears the prefix and emits `expired`.
    pub fn simulate_expiry(&self) {
        let expired = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if expired.is_some() {
            let _ = self.events.send(Event {
                event_type: EventType::Expired,
                prefix: expired,
                error: None,
            });
        }
    }

    /// Simulate a transient receiver failure.
    pub fn simulate_error(&self, error: impl Into<String>) {
        let _ = self.events.send(Event::failed(error));
    }

    /// Whether `start` has been called without a matching `stop`.
    pub fn is_started(&self) -> bool {
        *self.started.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Receiver for MockReceiver {
    async fn start(&self, _shutdown: CancellationToken) -> Result<(), ReceiverError> {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ReceiverError> {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = false;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn current_prefix(&self) -> Option<Prefix> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn source(&self) -> Source {
        self.source
    }
}
