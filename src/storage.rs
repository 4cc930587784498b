//! Persistence seam used by the connection manager, the pipeline and the API.

use crate::models::{
    Device, DeviceStatus, DeviceUpdate, NewDevice, NewReading, Reading, User, Viewer,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Device {0} not found")]
    DeviceNotFound(i64),
    #[error("Invalid value in column {column}: {value}")]
    Corrupt { column: &'static str, value: String },
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_devices(&self, viewer: &Viewer) -> Result<Vec<Device>, StorageError>;
    async fn get_device(&self, id: i64) -> Result<Option<Device>, StorageError>;
    async fn create_device(&self, owner_id: &str, device: NewDevice) -> Result<Device, StorageError>;
    async fn update_device(&self, id: i64, update: DeviceUpdate) -> Result<Device, StorageError>;
    /// Sets status and refreshes `last_seen`. `None` when the device no longer exists.
    async fn update_device_status(
        &self,
        id: i64,
        status: DeviceStatus,
    ) -> Result<Option<Device>, StorageError>;
    /// Removes the device together with its readings.
    async fn delete_device(&self, id: i64) -> Result<(), StorageError>;

    async fn add_reading(&self, reading: NewReading) -> Result<Reading, StorageError>;
    async fn get_readings(&self, device_id: i64, limit: usize) -> Result<Vec<Reading>, StorageError>;
    async fn get_recent_readings(
        &self,
        viewer: &Viewer,
        limit: usize,
    ) -> Result<Vec<Reading>, StorageError>;

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>, StorageError>;
    /// Creates the account or, for a known username, updates its role and token.
    /// Returns the stored account.
    async fn ensure_user(&self, user: User) -> Result<User, StorageError>;
}

/// Non-durable storage. Readings are kept in one window of the most recent
/// `history_limit` entries across all devices.
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    history_limit: usize,
}

#[derive(Default)]
struct MemoryState {
    devices: BTreeMap<i64, Device>,
    readings: VecDeque<Reading>,
    users: HashMap<String, User>,
    next_device_id: i64,
    next_reading_id: i64,
}

impl MemoryStorage {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            history_limit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_devices(&self, viewer: &Viewer) -> Result<Vec<Device>, StorageError> {
        Ok(self
            .lock()
            .devices
            .values()
            .filter(|d| viewer.can_access(d))
            .cloned()
            .collect())
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>, StorageError> {
        Ok(self.lock().devices.get(&id).cloned())
    }

    async fn create_device(&self, owner_id: &str, device: NewDevice) -> Result<Device, StorageError> {
        let mut state = self.lock();
        state.next_device_id += 1;
        let created = Device {
            id: state.next_device_id,
            owner_id: owner_id.to_string(),
            name: device.name,
            unique_id: device.unique_id,
            broker: device.broker,
            protocol: device.protocol.or_else(|| Some("mqtt".to_string())),
            topic: device.topic,
            username: device.username,
            password: device.password,
            status: DeviceStatus::Offline,
            description: device.description,
            last_seen: Some(OffsetDateTime::now_utc()),
        };
        state.devices.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_device(&self, id: i64, update: DeviceUpdate) -> Result<Device, StorageError> {
        let mut state = self.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or(StorageError::DeviceNotFound(id))?;
        update.apply(device);
        Ok(device.clone())
    }

    async fn update_device_status(
        &self,
        id: i64,
        status: DeviceStatus,
    ) -> Result<Option<Device>, StorageError> {
        let mut state = self.lock();
        Ok(state.devices.get_mut(&id).map(|device| {
            device.status = status;
            device.last_seen = Some(OffsetDateTime::now_utc());
            device.clone()
        }))
    }

    async fn delete_device(&self, id: i64) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.readings.retain(|r| r.device_id != id);
        state.devices.remove(&id);
        Ok(())
    }

    async fn add_reading(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let mut state = self.lock();
        state.next_reading_id += 1;
        let stored = Reading {
            id: state.next_reading_id,
            device_id: reading.device_id,
            kind: reading.kind,
            value: reading.value,
            unit: reading.unit,
            timestamp: OffsetDateTime::now_utc(),
        };
        state.readings.push_back(stored.clone());
        while state.readings.len() > self.history_limit {
            state.readings.pop_front();
        }
        Ok(stored)
    }

    async fn get_readings(&self, device_id: i64, limit: usize) -> Result<Vec<Reading>, StorageError> {
        Ok(self
            .lock()
            .readings
            .iter()
            .rev()
            .filter(|r| r.device_id == device_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_recent_readings(
        &self,
        viewer: &Viewer,
        limit: usize,
    ) -> Result<Vec<Reading>, StorageError> {
        let state = self.lock();
        Ok(state
            .readings
            .iter()
            .rev()
            .filter(|r| {
                state
                    .devices
                    .get(&r.device_id)
                    .map(|d| viewer.can_access(d))
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>, StorageError> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.api_token == token)
            .cloned())
    }

    async fn ensure_user(&self, user: User) -> Result<User, StorageError> {
        let mut state = self.lock();
        // Usernames are unique; an existing account keeps its id.
        let existing = state
            .users
            .values_mut()
            .find(|u| u.username == user.username);
        match existing {
            Some(existing) => {
                existing.role = user.role;
                existing.api_token = user.api_token;
                Ok(existing.clone())
            }
            None => {
                state.users.insert(user.id.clone(), user.clone());
                Ok(user)
            }
        }
    }
}
