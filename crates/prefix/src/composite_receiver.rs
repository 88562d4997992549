//! Primary/fallback receiver composition.
//!
//! Runs DHCPv6-PD as the primary source with Router Advertisements as the
//! fallback. The primary's events always flow through; after three
//! consecutive primary failures (or a primary expiry) the composite engages
//! the fallback, synthesizing an `acquired` event so consumers observe the
//! handoff. The policy itself is source-agnostic.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ReceiverError;
use crate::types::{Event, EventType, Prefix, Receiver, Source, EVENT_CHANNEL_CAPACITY};

/// Consecutive primary failures before the fallback engages.
const MAX_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Primary,
    Fallback,
}

struct CompositeState {
    active: Active,
    consecutive_failures: u32,
}

/// Runs a primary and a fallback receiver concurrently, switching to the
/// fallback when the primary fails repeatedly or expires.
pub struct CompositeReceiver {
    primary: Arc<dyn Receiver>,
    fallback: Arc<dyn Receiver>,
    state: Arc<RwLock<CompositeState>>,
    events: broadcast::Sender<Event>,
    shutdown: Mutex<Option<CancellationToken>>,
    merger: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CompositeReceiver {
    pub fn new(primary: Arc<dyn Receiver>, fallback: Arc<dyn Receiver>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            primary,
            fallback,
            state: Arc::new(RwLock::new(CompositeState {
                active: Active::Primary,
                consecutive_failures: 0,
            })),
            events,
            shutdown: Mutex::new(None),
            merger: Mutex::new(None),
        }
    }

    /// Whether the fallback receiver is currently the active source.
    pub fn is_using_fallback(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
            == Active::Fallback
    }

    async fn merge_events(
        primary: Arc<dyn Receiver>,
        fallback: Arc<dyn Receiver>,
        state: Arc<RwLock<CompositeState>>,
        events: broadcast::Sender<Event>,
        token: CancellationToken,
    ) {
        let mut primary_events = primary.events();
        let mut fallback_events = fallback.events();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,

                event = primary_events.recv() => match event {
                    Ok(event) => {
                        Self::handle_primary_event(&fallback, &state, &events, event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Dropped events are recoverable; state is re-read on
                        // the next event.
                        warn!("Composite receiver lagged {} primary event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },

                event = fallback_events.recv() => match event {
                    Ok(event) => {
                        Self::handle_fallback_event(&state, &events, event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Composite receiver lagged {} fallback event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    fn handle_primary_event(
        fallback: &Arc<dyn Receiver>,
        state: &RwLock<CompositeState>,
        events: &broadcast::Sender<Event>,
        event: Event,
    ) {
        let mut state = state.write().unwrap_or_else(|e| e.into_inner());

        match event.event_type {
            EventType::Failed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= MAX_FAILURES && state.active == Active::Primary {
                    state.active = Active::Fallback;
                    info!(
                        "Primary receiver failed {} times, engaging fallback",
                        state.consecutive_failures
                    );
                    if let Some(prefix) = fallback.current_prefix() {
                        let _ = events.send(Event::new(EventType::Acquired, Some(prefix)));
                    }
                }
                let _ = events.send(event);
            }

            EventType::Acquired | EventType::Renewed | EventType::Changed => {
                // Primary is healthy again
                if state.active == Active::Fallback {
                    info!("Primary receiver recovered, leaving fallback");
                }
                state.consecutive_failures = 0;
                state.active = Active::Primary;
                let _ = events.send(event);
            }

            EventType::Expired => {
                if let Some(prefix) = fallback.current_prefix() {
                    state.active = Active::Fallback;
                    info!("Primary lease expired, engaging fallback");
                    let _ = events.send(Event::new(EventType::Acquired, Some(prefix)));
                } else {
                    let _ = events.send(event);
                }
            }
        }
    }

    fn handle_fallback_event(
        state: &RwLock<CompositeState>,
        events: &broadcast::Sender<Event>,
        event: Event,
    ) {
        let state = state.read().unwrap_or_else(|e| e.into_inner());

        // The fallback keeps tracking in the background; its events are only
        // surfaced while it is the active source.
        if state.active == Active::Fallback {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Receiver for CompositeReceiver {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), ReceiverError> {
        {
            let guard = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Ok(());
            }
        }

        let token = shutdown.child_token();

        self.primary.start(token.clone()).await?;
        if let Err(e) = self.fallback.start(token.clone()).await {
            let _ = self.primary.stop().await;
            return Err(e);
        }

        let handle = tokio::spawn(Self::merge_events(
            self.primary.clone(),
            self.fallback.clone(),
            self.state.clone(),
            self.events.clone(),
            token.clone(),
        ));

        *self.merger.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);

        Ok(())
    }

    async fn stop(&self) -> Result<(), ReceiverError> {
        let token = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(token) = token else {
            return Ok(());
        };
        token.cancel();

        let handle = self.merger.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Stop both children; report the first error after trying both.
        let primary_result = self.primary.stop().await;
        let fallback_result = self.fallback.stop().await;
        primary_result.and(fallback_result)
    }

    fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn current_prefix(&self) -> Option<Prefix> {
        self.primary
            .current_prefix()
            .or_else(|| self.fallback.current_prefix())
    }

    /// The source of whichever child currently holds a prefix; callers that
    /// persist the source should record it per event rather than assume it
    /// stays stable.
    fn source(&self) -> Source {
        if self.primary.current_prefix().is_some() {
            return self.primary.source();
        }
        if self.fallback.current_prefix().is_some() {
            return self.fallback.source();
        }
        self.primary.source()
    }
}
