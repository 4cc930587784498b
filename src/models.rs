use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Offline,
    Connected,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Offline => "offline",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(DeviceStatus::Offline),
            "connected" => Ok(DeviceStatus::Connected),
            "error" => Ok(DeviceStatus::Error),
            other => Err(format!("unknown device status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Who is asking. Storage queries are scoped by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: String,
    pub role: Role,
}

impl Viewer {
    /// The internal identity used by the connection manager to see every device.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_access(&self, device: &Device) -> bool {
        self.is_admin() || device.owner_id == self.user_id
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub api_token: String,
}

impl User {
    pub fn viewer(&self) -> Viewer {
        Viewer {
            user_id: self.id.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub unique_id: Option<String>,
    pub broker: Option<String>,
    pub protocol: Option<String>,
    pub topic: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub status: DeviceStatus,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

impl Device {
    /// Broker and topic, when both are configured and non-empty.
    pub fn connection_target(&self) -> Option<(&str, &str)> {
        let broker = self.broker.as_deref().filter(|b| !b.trim().is_empty())?;
        let topic = self.topic.as_deref().filter(|t| !t.trim().is_empty())?;
        Some((broker, topic))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub name: String,
    pub unique_id: Option<String>,
    pub broker: Option<String>,
    pub protocol: Option<String>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub description: Option<String>,
}

/// Partial update. An empty string clears an optional field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub unique_id: Option<String>,
    pub broker: Option<String>,
    pub protocol: Option<String>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub description: Option<String>,
}

impl DeviceUpdate {
    /// True when the update changes how the device is reached.
    pub fn touches_connection(&self) -> bool {
        self.broker.is_some()
            || self.protocol.is_some()
            || self.topic.is_some()
            || self.username.is_some()
            || self.password.is_some()
    }

    pub fn apply(self, device: &mut Device) {
        fn merge(target: &mut Option<String>, value: Option<String>) {
            if let Some(value) = value {
                *target = if value.is_empty() { None } else { Some(value) };
            }
        }

        if let Some(name) = self.name.filter(|n| !n.is_empty()) {
            device.name = name;
        }
        merge(&mut device.unique_id, self.unique_id);
        merge(&mut device.broker, self.broker);
        merge(&mut device.protocol, self.protocol);
        merge(&mut device.topic, self.topic);
        merge(&mut device.username, self.username);
        merge(&mut device.password, self.password);
        merge(&mut device.description, self.description);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: i64,
    pub kind: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: i64,
    pub device_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub unit: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
