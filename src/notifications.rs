//! Alert feed derived from the device roster and the most recent readings.

use crate::models::{Device, DeviceStatus, Reading};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

/// Most recent readings scanned for threshold breaches.
pub const READING_WINDOW: usize = 50;
pub const MAX_NOTIFICATIONS: usize = 10;

const SYNC_WINDOW: Duration = Duration::hours(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Alert,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: &'static str,
    pub device: String,
    /// `HH:MM` (UTC) of the event, or `Unknown`.
    pub time: String,
}

/// Title of the alert a reading raises, if any. A later rule wins when a type name
/// matches several (`temp_volt` is judged as a voltage).
pub fn threshold_alert(reading: &Reading) -> Option<&'static str> {
    let kind = reading.kind.to_lowercase();
    let value = reading.value;
    let mut title = None;
    if kind.contains("temp") && value > 80.0 {
        title = Some("High Temperature");
    }
    if kind.contains("hum") && value > 90.0 {
        title = Some("High Humidity");
    }
    if kind.contains("volt") && (value > 250.0 || value < 180.0) {
        title = Some("Voltage Instability");
    }
    title
}

/// Offline devices first, then threshold breaches in reading order, then devices
/// seen within the last hour. Capped at `MAX_NOTIFICATIONS`.
pub fn build(devices: &[Device], readings: &[Reading], now: OffsetDateTime) -> Vec<Notification> {
    let mut feed = Vec::new();
    let mut push = |kind: NotificationKind, title: &'static str, device: String, time: String| {
        let id = feed.len() as u32 + 1;
        feed.push(Notification {
            id,
            kind,
            title,
            device,
            time,
        });
    };

    for device in devices.iter().filter(|d| d.status == DeviceStatus::Offline) {
        let time = device.last_seen.map(clock).unwrap_or_else(|| "Unknown".to_string());
        push(NotificationKind::Alert, "Device Offline", device.name.clone(), time);
    }

    for reading in readings {
        let Some(title) = threshold_alert(reading) else {
            continue;
        };
        let device = devices
            .iter()
            .find(|d| d.id == reading.device_id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| format!("Device #{}", reading.device_id));
        push(NotificationKind::Alert, title, device, clock(reading.timestamp));
    }

    for device in devices {
        if let Some(seen) = device.last_seen.filter(|seen| now - *seen < SYNC_WINDOW) {
            push(NotificationKind::Success, "Device Sync", device.name.clone(), clock(seen));
        }
    }

    feed.truncate(MAX_NOTIFICATIONS);
    feed
}

fn clock(at: OffsetDateTime) -> String {
    format!("{:02}:{:02}", at.hour(), at.minute())
}
