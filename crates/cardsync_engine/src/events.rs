//! Typed event stream published by the orchestrator.
//!
//! Progress-style events travel on a bounded broadcast channel: a slow
//! subscriber loses the oldest ones and never blocks the engine. Conflict,
//! dead-letter and session outcome events go to every subscriber through
//! an unbounded queue of its own and are never dropped.

use crate::metrics::SyncMetrics;
use crate::session::{SessionState, SyncMode};
use cardsync_protocol::{ConflictKind, Resolution, SyncConflict};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// An event emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A session left `idle`.
    SessionStarted {
        /// Session id.
        session_id: Uuid,
        /// Chosen mode.
        mode: SyncMode,
    },
    /// A session changed state.
    StateChanged {
        /// Session id.
        session_id: Uuid,
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
    },
    /// Progress of the running session.
    Progress {
        /// Session id.
        session_id: Uuid,
        /// Percent complete, 0 to 100.
        progress: u8,
        /// Operations settled so far.
        completed: usize,
        /// Operations estimated for the session.
        total: usize,
    },
    /// A divergence was detected.
    ConflictDetected {
        /// Conflict id.
        conflict_id: Uuid,
        /// Entity concerned.
        entity_id: String,
        /// Divergence kind.
        kind: ConflictKind,
    },
    /// A conflict waits for a user decision.
    ManualConflict {
        /// The open conflict.
        conflict: Box<SyncConflict>,
    },
    /// A conflict was closed.
    ConflictResolved {
        /// Conflict id.
        conflict_id: Uuid,
        /// Entity concerned.
        entity_id: String,
        /// Applied resolution.
        resolution: Resolution,
        /// Whether a policy closed it.
        auto_resolved: bool,
    },
    /// An operation moved to the dead-letter set.
    DeadLettered {
        /// Operation id.
        op_id: u64,
        /// Entity concerned.
        entity_id: String,
        /// Last failure.
        reason: String,
    },
    /// A session finished with everything settled.
    SessionCompleted {
        /// Session id.
        session_id: Uuid,
        /// Operations pushed or pulled.
        operations: usize,
        /// Session duration.
        duration_ms: u64,
    },
    /// A session stopped before finishing.
    SessionPaused {
        /// Session id.
        session_id: Uuid,
        /// Why it paused.
        reason: String,
    },
    /// A session failed.
    SessionFailed {
        /// Session id.
        session_id: Uuid,
        /// Why it failed.
        reason: String,
    },
    /// A failed session was rolled back to its backup.
    SessionRolledBack {
        /// Session id.
        session_id: Uuid,
    },
    /// A metrics snapshot.
    Metrics(SyncMetrics),
}

impl SyncEvent {
    /// Returns true for events that must reach every subscriber.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            SyncEvent::SessionStarted { .. }
                | SyncEvent::ConflictDetected { .. }
                | SyncEvent::ManualConflict { .. }
                | SyncEvent::ConflictResolved { .. }
                | SyncEvent::DeadLettered { .. }
                | SyncEvent::SessionCompleted { .. }
                | SyncEvent::SessionPaused { .. }
                | SyncEvent::SessionFailed { .. }
                | SyncEvent::SessionRolledBack { .. }
        )
    }
}

/// Fan-out point for engine events.
#[derive(Debug)]
pub struct EventBus {
    lossy: broadcast::Sender<SyncEvent>,
    critical: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl EventBus {
    /// Creates a bus whose lossy channel holds `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (lossy, _) = broadcast::channel(capacity.max(1));
        Self {
            lossy,
            critical: Mutex::new(Vec::new()),
        }
    }

    /// Publishes an event. Never blocks.
    pub fn publish(&self, event: SyncEvent) {
        if event.is_critical() {
            self.critical
                .lock()
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        } else {
            // No receivers is fine.
            let _ = self.lossy.send(event);
        }
    }

    /// Adds a subscriber.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.critical.lock().push(tx);
        EventSubscription {
            lossy: self.lossy.subscribe(),
            critical: rx,
            dropped: 0,
        }
    }
}

/// Receiving end of an [`EventBus`].
///
/// Critical events are delivered ahead of pending progress events.
#[derive(Debug)]
pub struct EventSubscription {
    lossy: broadcast::Receiver<SyncEvent>,
    critical: mpsc::UnboundedReceiver<SyncEvent>,
    dropped: u64,
}

impl EventSubscription {
    /// Waits for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        let mut lossy_open = true;
        loop {
            tokio::select! {
                biased;
                event = self.critical.recv() => return event,
                event = self.lossy.recv(), if lossy_open => match event {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => self.dropped += n,
                    Err(broadcast::error::RecvError::Closed) => lossy_open = false,
                },
            }
        }
    }

    /// Returns the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        if let Ok(event) = self.critical.try_recv() {
            return Some(event);
        }
        loop {
            match self.lossy.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.dropped += n,
                Err(_) => return None,
            }
        }
    }

    /// Drains every ready event.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Progress events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(n: u8) -> SyncEvent {
        SyncEvent::Progress {
            session_id: Uuid::nil(),
            progress: n,
            completed: n as usize,
            total: 100,
        }
    }

    fn failed() -> SyncEvent {
        SyncEvent::SessionFailed {
            session_id: Uuid::nil(),
            reason: "auth".into(),
        }
    }

    #[test]
    fn progress_overflow_drops_oldest() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        for n in 0..10 {
            bus.publish(progress(n));
        }

        let events = sub.drain();
        assert_eq!(events, (6..10).map(progress).collect::<Vec<_>>());
        assert_eq!(sub.dropped(), 6);
    }

    #[test]
    fn critical_events_are_never_dropped() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        for _ in 0..500 {
            bus.publish(failed());
            bus.publish(progress(1));
        }

        let critical = sub
            .drain()
            .into_iter()
            .filter(SyncEvent::is_critical)
            .count();
        assert_eq!(critical, 500);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        drop(sub);
        bus.publish(failed());
        assert!(bus.critical.lock().is_empty());
    }

    #[tokio::test]
    async fn recv_prefers_critical_events() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        bus.publish(progress(1));
        bus.publish(failed());

        assert_eq!(sub.recv().await, Some(failed()));
        assert_eq!(sub.recv().await, Some(progress(1)));
    }
}
