//! Real-time fan-out to WebSocket subscribers.

use crate::models::{Reading, Role};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

pub type SubscriberId = u64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushEvent {
    #[serde(rename_all = "camelCase")]
    Update { device_id: i64, data: UpdateData },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateData {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading: Option<Reading>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl PushEvent {
    pub fn raw(device_id: i64, payload: Value) -> Self {
        PushEvent::Update {
            device_id,
            data: UpdateData {
                status: "connected",
                raw: Some(payload),
                reading: None,
                timestamp: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn reading(reading: Reading) -> Self {
        PushEvent::Update {
            device_id: reading.device_id,
            data: UpdateData {
                status: "connected",
                raw: None,
                timestamp: reading.timestamp,
                reading: Some(reading),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    /// Admins see everything; unscoped events go to everyone; otherwise only the owner.
    pub fn may_receive(&self, owner_id: Option<&str>) -> bool {
        match owner_id {
            _ if self.role == Role::Admin => true,
            None => true,
            Some(owner) => owner == self.user_id,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<Arc<str>>,
    identity: Option<Identity>,
}

/// Registry of open subscriber connections. Each connection drains its own bounded
/// queue, so a stalled client only loses its own events.
pub struct Hub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Opens an unregistered connection. It receives nothing until `register`.
    pub fn open(&self) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.write().insert(id, Subscriber { tx, identity: None });
        (id, rx)
    }

    pub fn register(&self, id: SubscriberId, identity: Identity) -> bool {
        match self.write().get_mut(&id) {
            Some(subscriber) => {
                info!(subscriber = id, user = %identity.user_id, "subscriber registered");
                subscriber.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    pub fn close(&self, id: SubscriberId) {
        self.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Sends `event` to every registered subscriber allowed to see `owner_id`.
    /// Returns the number of queues the event was placed on.
    pub fn broadcast(&self, event: &PushEvent, owner_id: Option<&str>) -> usize {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                debug!("dropping unserializable event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let subscribers = self.read();
            for (id, subscriber) in subscribers.iter() {
                let Some(identity) = &subscriber.identity else {
                    continue;
                };
                if !identity.may_receive(owner_id) {
                    continue;
                }
                match subscriber.tx.try_send(Arc::clone(&payload)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!(subscriber = id, "subscriber queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.write();
            for id in gone {
                subscribers.remove(&id);
            }
        }
        delivered
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
