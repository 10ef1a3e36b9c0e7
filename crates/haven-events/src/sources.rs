//! Event source registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use haven_core::types::Event;

use crate::error::{EventsError, Result};

/// A producer of events for the dispatcher. `start` hands the source the
/// shared event channel; `stop` asks it to wind down.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, tx: mpsc::Sender<Event>) -> Result<()>;
    async fn stop(&self);
}

/// A push-boundary source: external feeds (the device-state client, the
/// indexing task, webhook routes) publish through a cloned handle, and the
/// source forwards into the dispatcher channel once started.
pub struct PushSource {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
}

impl PushSource {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            tx: Mutex::new(None),
        })
    }

    /// Publish an event payload under this source's tag.
    pub async fn publish(&self, payload: Value) -> Result<()> {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            warn!(source = %self.name, "event published before source start — dropped");
            return Err(EventsError::ChannelClosed);
        };
        tx.send(Event::new(self.name.clone(), payload))
            .await
            .map_err(|_| EventsError::ChannelClosed)
    }
}

#[async_trait]
impl EventSource for PushSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, tx: mpsc::Sender<Event>) -> Result<()> {
        *self.tx.lock().await = Some(tx);
        info!(source = %self.name, "event source started");
        Ok(())
    }

    async fn stop(&self) {
        *self.tx.lock().await = None;
        info!(source = %self.name, "event source stopped");
    }
}

/// The fixed set of sources a deployment runs, started and stopped
/// together.
pub struct EventSourceRegistry {
    sources: Vec<Arc<dyn EventSource>>,
}

impl EventSourceRegistry {
    pub fn new(sources: Vec<Arc<dyn EventSource>>) -> Self {
        Self { sources }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EventSource>> {
        self.sources.iter().find(|s| s.name() == name).cloned()
    }

    pub async fn start_all(&self, tx: mpsc::Sender<Event>) -> Result<()> {
        for source in &self.sources {
            source.start(tx.clone()).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for source in &self.sources {
            source.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn push_source_forwards_after_start() {
        let source = PushSource::new("home_assistant");
        // Before start: publishing fails loudly.
        assert!(source.publish(json!({"x": 1})).await.is_err());

        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx).await.unwrap();
        source
            .publish(json!({"entity_id": "sensor.door"}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "home_assistant");
        assert_eq!(event.payload["entity_id"], "sensor.door");

        source.stop().await;
        assert!(source.publish(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn registry_starts_every_source() {
        let a = PushSource::new("home_assistant");
        let b = PushSource::new("document_indexing");
        let registry =
            EventSourceRegistry::new(vec![a.clone() as Arc<dyn EventSource>, b.clone()]);

        let (tx, mut rx) = mpsc::channel(8);
        registry.start_all(tx).await.unwrap();
        a.publish(json!({"n": 1})).await.unwrap();
        b.publish(json!({"n": 2})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().source, "home_assistant");
        assert_eq!(rx.recv().await.unwrap().source, "document_indexing");

        assert!(registry.get("webhook").is_none());
        assert!(registry.get("home_assistant").is_some());
    }
}
