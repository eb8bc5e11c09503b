//! # Topic Router
//!
//! Handler table keyed by wildcard pattern. `dispatch` spawns one task per
//! matching handler and returns at once, so the MQTT receive loop never
//! waits on a handler.
//!
//! Handler tasks are kept in a `JoinSet`. The broker has already been
//! acknowledged by the time a handler runs, so shutdown calls [`TopicRouter::drain`]
//! before the store closes; otherwise the message would be gone for good.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use fieldgate_core::topic_matches;
use fieldgate_core::validation::validate_topic_pattern;

use crate::error::IngestResult;

/// Receives messages whose topic matched the pattern it was registered under.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: Value) -> IngestResult<()>;
}

/// Pattern → handler table. Registering a pattern again replaces its handler.
#[derive(Default)]
pub struct TopicRouter {
    handlers: RwLock<BTreeMap<String, Arc<dyn MessageHandler>>>,
    handler_errors: Arc<AtomicU64>,
    in_flight: Mutex<JoinSet<()>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_handler(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> IngestResult<()> {
        let pattern = pattern.into();
        validate_topic_pattern(&pattern)?;
        debug!(pattern = %pattern, "Registered topic handler");
        self.handlers.write().await.insert(pattern, handler);
        Ok(())
    }

    /// Returns `true` if a handler was registered under `pattern`.
    pub async fn unregister_handler(&self, pattern: &str) -> bool {
        self.handlers.write().await.remove(pattern).is_some()
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Handler failures seen since start.
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    /// Fires every handler whose pattern matches `topic`.
    ///
    /// Handlers run on their own tasks; a slow or failing one delays nothing.
    ///
    /// ## Returns
    /// Number of handlers dispatched.
    pub async fn dispatch(&self, topic: &str, payload: Value) -> usize {
        let matched: Vec<(String, Arc<dyn MessageHandler>)> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|(pattern, _)| topic_matches(topic, pattern))
            .map(|(pattern, handler)| (pattern.clone(), Arc::clone(handler)))
            .collect();

        if matched.is_empty() {
            debug!(topic = %topic, "No handler for topic");
            return 0;
        }

        let mut in_flight = self.in_flight.lock().await;
        // Reap finished tasks so the set only holds live work.
        while let Some(done) = in_flight.try_join_next() {
            self.record_join(done);
        }

        for (pattern, handler) in &matched {
            let handler = Arc::clone(handler);
            let errors = Arc::clone(&self.handler_errors);
            let pattern = pattern.clone();
            let topic = topic.to_string();
            let payload = payload.clone();

            in_flight.spawn(async move {
                if let Err(e) = handler.handle(&topic, payload).await {
                    errors.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %topic, pattern = %pattern, error = %e, "Topic handler failed");
                }
            });
        }

        matched.len()
    }

    /// Handler tasks spawned and not yet reaped.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Waits for every dispatched handler to finish.
    ///
    /// Call after the receive loop has stopped. A `dispatch` issued while
    /// draining blocks until the drain completes.
    pub async fn drain(&self) {
        let mut in_flight = self.in_flight.lock().await;
        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "Draining topic handlers");
        }
        while let Some(done) = in_flight.join_next().await {
            self.record_join(done);
        }
    }

    fn record_join(&self, done: Result<(), tokio::task::JoinError>) {
        if let Err(e) = done {
            self.handler_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Topic handler task aborted");
        }
    }
}

/// Parses a message body as JSON, wrapping anything else as `{"raw": text}`.
pub fn decode_payload(bytes: &[u8]) -> Value {
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(_) => json!({ "raw": String::from_utf8_lossy(bytes) }),
    }
}
