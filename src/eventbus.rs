//! Buffered in-process event bus.
//!
//! Events accumulate per channel; a flush hands every registered consumer
//! one map of channel name to accumulated payloads. Flushing is
//! cooperative and at most once per tick: events emitted while a flush is
//! running land in the next batch.

use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::types::events::Event;

/// A flushed batch: channel name to payloads, in emission order.
pub type EventBatch = HashMap<&'static str, Vec<Event>>;

type Consumer = Box<dyn Fn(&EventBatch) + Send + Sync>;

/// Typed pub/sub with per-channel batching.
#[derive(Default)]
pub struct EventBus {
    buffer: Mutex<EventBatch>,
    consumers: Mutex<Vec<Consumer>>,
    flushing: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one event under its channel.
    pub fn emit(&self, event: Event) {
        let channel = event.channel();
        self.buffer
            .lock()
            .expect("event buffer lock")
            .entry(channel)
            .or_default()
            .push(event);
    }

    /// Register a consumer that receives every subsequent flush.
    pub fn process<F>(&self, consumer: F)
    where
        F: Fn(&EventBatch) + Send + Sync + 'static,
    {
        self.consumers
            .lock()
            .expect("consumer lock")
            .push(Box::new(consumer));
    }

    /// Drain the buffer into consumers. Re-entrant calls are no-ops, so a
    /// consumer emitting events leaves them for the next tick.
    pub fn flush(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let batch = std::mem::take(&mut *self.buffer.lock().expect("event buffer lock"));
        if !batch.is_empty() {
            debug!(target: "EventBus", "flushing {} channels", batch.len());
            let consumers = self.consumers.lock().expect("consumer lock");
            for consumer in consumers.iter() {
                consumer(&batch);
            }
        }

        self.flushing.store(false, Ordering::SeqCst);
    }

    /// Whether anything is waiting to be flushed.
    pub fn is_dirty(&self) -> bool {
        !self.buffer.lock().expect("event buffer lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::events::{ConnectionState, ConnectionUpdate};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn connection_event() -> Event {
        Event::ConnectionUpdate(ConnectionUpdate {
            connection: ConnectionState::Open,
            last_disconnect: None,
        })
    }

    #[test]
    fn test_batching_per_channel() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.process(move |batch| {
            let mut channels: Vec<(String, usize)> = batch
                .iter()
                .map(|(name, events)| (name.to_string(), events.len()))
                .collect();
            channels.sort();
            seen_clone.lock().unwrap().extend(channels);
        });

        bus.emit(connection_event());
        bus.emit(connection_event());
        bus.emit(Event::CredsUpdate);
        bus.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("connection.update".to_string(), 2),
                ("creds.update".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_flush_without_events_is_silent() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        bus.process(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_emit_during_flush_lands_in_next_tick() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let bus_clone = bus.clone();
        let calls_clone = calls.clone();
        bus.process(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            // re-entrant emit + flush from inside a consumer
            bus_clone.emit(Event::CredsUpdate);
            bus_clone.flush();
        });

        bus.emit(connection_event());
        bus.flush();
        // the inner flush was a no-op
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bus.is_dirty());

        bus.flush();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
