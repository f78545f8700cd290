use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;

use switchyard_types::HubEvent;

const CHANNEL_CAPACITY: usize = 2048;

/// Key-addressed broadcast hub: task ids, session ids and the dashboard key.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<HubEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<HubEvent> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, key: &str, mut event: HubEvent) {
        if key.is_empty() {
            return;
        }
        event.timestamp = Utc::now();
        let sender = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            channels.get(key).cloned()
        };
        let Some(sender) = sender else {
            return;
        };
        if sender.send(event).is_err() {
            // every receiver is gone
            let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
            if channels.get(key).is_some_and(|tx| tx.receiver_count() == 0) {
                channels.remove(key);
            }
        }
    }

    /// Publishes once per distinct non-empty key.
    pub fn publish_multi(&self, keys: &[&str], event: HubEvent) {
        let mut seen = HashSet::new();
        for key in keys {
            if !key.is_empty() && seen.insert(*key) {
                self.publish(key, event.clone());
            }
        }
    }

    pub fn has_subscribers(&self, key: &str) -> bool {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels
            .get(key)
            .is_some_and(|tx| tx.receiver_count() > 0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
