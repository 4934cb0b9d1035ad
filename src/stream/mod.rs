//! Data stream subscription.
//!
//! Telemetry and parameter streams deliver records carrying a generation
//! time. The backfill engine only cares about that timestamp, so the
//! subscription surface is reduced to it.

use crate::time::Instant;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream '{0}' does not exist")]
    NotFound(String),

    #[error("stream '{0}' already exists")]
    AlreadyExists(String),
}

/// Receives records from a stream. Called on whatever thread delivers the
/// record; implementations must return quickly.
pub trait StreamSubscriber: Send + Sync {
    fn on_record(&self, stream: &str, gentime: Instant);

    fn stream_closed(&self, _stream: &str) {}
}

pub trait StreamRegistry: Send + Sync {
    fn subscribe(
        &self,
        stream: &str,
        subscriber: Arc<dyn StreamSubscriber>,
    ) -> Result<(), StreamError>;

    /// Removes `subscriber` (compared by identity). Unknown streams and
    /// subscribers are ignored.
    fn unsubscribe(&self, stream: &str, subscriber: &Arc<dyn StreamSubscriber>);
}

/// In-process stream registry with synchronous fan-out.
#[derive(Default)]
pub struct StreamHub {
    streams: RwLock<HashMap<String, Vec<Arc<dyn StreamSubscriber>>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hub with the given streams already declared.
    pub fn with_streams<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hub = Self::new();
        {
            let mut streams = hub.streams.write().unwrap_or_else(|e| e.into_inner());
            for name in names {
                streams.entry(name.into()).or_default();
            }
        }
        hub
    }

    pub fn create_stream(&self, name: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        if streams.contains_key(name) {
            return Err(StreamError::AlreadyExists(name.to_string()));
        }
        streams.insert(name.to_string(), Vec::new());
        info!(stream = %name, "Stream created");
        Ok(())
    }

    /// Delivers one record to every current subscriber of `stream`.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, stream: &str, gentime: Instant) -> Result<usize, StreamError> {
        // Clone the subscriber list so callbacks run without the lock held.
        let subscribers = {
            let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
            streams
                .get(stream)
                .ok_or_else(|| StreamError::NotFound(stream.to_string()))?
                .clone()
        };
        for subscriber in &subscribers {
            subscriber.on_record(stream, gentime);
        }
        Ok(subscribers.len())
    }

    /// Removes the stream and notifies its subscribers.
    pub fn close_stream(&self, stream: &str) -> Result<(), StreamError> {
        let subscribers = {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            streams
                .remove(stream)
                .ok_or_else(|| StreamError::NotFound(stream.to_string()))?
        };
        for subscriber in &subscribers {
            subscriber.stream_closed(stream);
        }
        info!(stream = %stream, subscribers = subscribers.len(), "Stream closed");
        Ok(())
    }

    pub fn stream_names(&self) -> Vec<String> {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = streams.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, stream: &str) -> usize {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        streams.get(stream).map_or(0, |subs| subs.len())
    }
}

impl StreamRegistry for StreamHub {
    fn subscribe(
        &self,
        stream: &str,
        subscriber: Arc<dyn StreamSubscriber>,
    ) -> Result<(), StreamError> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let subscribers = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NotFound(stream.to_string()))?;
        subscribers.push(subscriber);
        debug!(stream = %stream, subscribers = subscribers.len(), "Subscriber added");
        Ok(())
    }

    fn unsubscribe(&self, stream: &str, subscriber: &Arc<dyn StreamSubscriber>) {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = streams.get_mut(stream) {
            subscribers.retain(|s| !Arc::ptr_eq(s, subscriber));
            debug!(stream = %stream, subscribers = subscribers.len(), "Subscriber removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<(String, Instant)>>,
        closed: Mutex<Vec<String>>,
    }

    impl StreamSubscriber for Recorder {
        fn on_record(&self, stream: &str, gentime: Instant) {
            self.records.lock().unwrap().push((stream.to_string(), gentime));
        }

        fn stream_closed(&self, stream: &str) {
            self.closed.lock().unwrap().push(stream.to_string());
        }
    }

    #[test]
    fn test_publish_reaches_subscribers() {
        let hub = StreamHub::with_streams(["tm_realtime", "pp_realtime"]);
        let recorder = Arc::new(Recorder::default());
        let sub: Arc<dyn StreamSubscriber> = recorder.clone();

        hub.subscribe("tm_realtime", Arc::clone(&sub)).unwrap();
        assert_eq!(hub.publish("tm_realtime", 42).unwrap(), 1);
        assert_eq!(hub.publish("pp_realtime", 43).unwrap(), 0);

        let records = recorder.records.lock().unwrap().clone();
        assert_eq!(records, vec![("tm_realtime".to_string(), 42)]);
    }

    #[test]
    fn test_unknown_stream() {
        let hub = StreamHub::new();
        let sub: Arc<dyn StreamSubscriber> = Arc::new(Recorder::default());
        assert_eq!(
            hub.subscribe("nope", sub),
            Err(StreamError::NotFound("nope".to_string()))
        );
        assert_eq!(
            hub.publish("nope", 1),
            Err(StreamError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_unsubscribe_by_identity() {
        let hub = StreamHub::with_streams(["tm"]);
        let a: Arc<dyn StreamSubscriber> = Arc::new(Recorder::default());
        let b: Arc<dyn StreamSubscriber> = Arc::new(Recorder::default());
        hub.subscribe("tm", Arc::clone(&a)).unwrap();
        hub.subscribe("tm", Arc::clone(&b)).unwrap();

        hub.unsubscribe("tm", &a);
        assert_eq!(hub.subscriber_count("tm"), 1);
        hub.unsubscribe("missing", &b);
        assert_eq!(hub.subscriber_count("tm"), 1);
    }

    #[test]
    fn test_create_and_close_stream() {
        let hub = StreamHub::new();
        hub.create_stream("tm_dump").unwrap();
        assert_eq!(
            hub.create_stream("tm_dump"),
            Err(StreamError::AlreadyExists("tm_dump".to_string()))
        );

        let recorder = Arc::new(Recorder::default());
        hub.subscribe("tm_dump", recorder.clone()).unwrap();
        hub.close_stream("tm_dump").unwrap();

        assert_eq!(*recorder.closed.lock().unwrap(), vec!["tm_dump".to_string()]);
        assert!(hub.stream_names().is_empty());
    }
}
