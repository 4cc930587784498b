use crate::models::{
    Device, DeviceStatus, DeviceUpdate, NewDevice, NewReading, Reading, Role, User, Viewer,
};
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use log::{error, info, warn};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const DEVICE_COLUMNS: &str = "id, owner_id, name, unique_id, broker, protocol, topic, \
                              username, password, status, description, last_seen";

pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
    max_readings_per_device: Option<usize>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(
        db_path: &str,
        pool_size: u32,
        max_readings_per_device: Option<usize>,
    ) -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update(None, "foreign_keys", true)
        });
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self {
            pool,
            max_readings_per_device,
        })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StorageError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL DEFAULT 'user',
            api_token TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            unique_id TEXT,
            broker TEXT,
            protocol TEXT DEFAULT 'mqtt',
            topic TEXT,
            username TEXT,
            password TEXT,
            status TEXT NOT NULL DEFAULT 'offline',
            description TEXT,
            last_seen TEXT
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            type TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_readings_device ON readings(device_id, id);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Runs `f` with a pooled connection on the blocking thread pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await?
    }
}

fn now_text() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

fn parse_timestamp(column: &'static str, raw: &str) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| StorageError::Corrupt {
        column,
        value: raw.to_string(),
    })
}

/// Column values as stored; converted to domain types outside of rusqlite's row
/// callback so conversion errors keep their own variant.
struct DeviceRow {
    id: i64,
    owner_id: String,
    name: String,
    unique_id: Option<String>,
    broker: Option<String>,
    protocol: Option<String>,
    topic: Option<String>,
    username: Option<String>,
    password: Option<String>,
    status: String,
    description: Option<String>,
    last_seen: Option<String>,
}

impl DeviceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            unique_id: row.get(3)?,
            broker: row.get(4)?,
            protocol: row.get(5)?,
            topic: row.get(6)?,
            username: row.get(7)?,
            password: row.get(8)?,
            status: row.get(9)?,
            description: row.get(10)?,
            last_seen: row.get(11)?,
        })
    }

    fn into_device(self) -> Result<Device, StorageError> {
        let status = self.status.parse::<DeviceStatus>().map_err(|_| StorageError::Corrupt {
            column: "devices.status",
            value: self.status.clone(),
        })?;
        let last_seen = match self.last_seen.as_deref() {
            Some(raw) => Some(parse_timestamp("devices.last_seen", raw)?),
            None => None,
        };
        Ok(Device {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            unique_id: self.unique_id,
            broker: self.broker,
            protocol: self.protocol,
            topic: self.topic,
            username: self.username,
            password: self.password,
            status,
            description: self.description,
            last_seen,
        })
    }
}

struct ReadingRow {
    id: i64,
    device_id: i64,
    kind: String,
    value: f64,
    unit: String,
    timestamp: String,
}

impl ReadingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            kind: row.get(2)?,
            value: row.get(3)?,
            unit: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_reading(self) -> Result<Reading, StorageError> {
        Ok(Reading {
            id: self.id,
            device_id: self.device_id,
            kind: self.kind,
            value: self.value,
            unit: self.unit,
            timestamp: parse_timestamp("readings.timestamp", &self.timestamp)?,
        })
    }
}

fn query_devices(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Device>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, DeviceRow::from_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?.into_device()?);
    }
    Ok(results)
}

fn query_readings(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Reading>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ReadingRow::from_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?.into_reading()?);
    }
    Ok(results)
}

fn select_device(conn: &Connection, id: i64) -> Result<Option<Device>, StorageError> {
    let sql = format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS);
    Ok(query_devices(conn, &sql, params![id])?.into_iter().next())
}

#[async_trait]
impl Storage for DatabaseService {
    async fn get_devices(&self, viewer: &Viewer) -> Result<Vec<Device>, StorageError> {
        let viewer = viewer.clone();
        self.run(move |conn| {
            if viewer.is_admin() {
                let sql = format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS);
                query_devices(conn, &sql, params![])
            } else {
                let sql = format!(
                    "SELECT {} FROM devices WHERE owner_id = ?1 ORDER BY id",
                    DEVICE_COLUMNS
                );
                query_devices(conn, &sql, params![viewer.user_id])
            }
        })
        .await
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>, StorageError> {
        self.run(move |conn| select_device(conn, id)).await
    }

    async fn create_device(&self, owner_id: &str, device: NewDevice) -> Result<Device, StorageError> {
        let owner_id = owner_id.to_string();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO devices (owner_id, name, unique_id, broker, protocol, topic,
                                     username, password, status, description, last_seen)
                VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 'mqtt'), ?6, ?7, ?8, 'offline', ?9, ?10)
                "#,
                params![
                    owner_id,
                    device.name,
                    device.unique_id,
                    device.broker,
                    device.protocol,
                    device.topic,
                    device.username,
                    device.password,
                    device.description,
                    now_text(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            select_device(conn, id)?.ok_or(StorageError::DeviceNotFound(id))
        })
        .await
    }

    async fn update_device(&self, id: i64, update: DeviceUpdate) -> Result<Device, StorageError> {
        self.run(move |conn| {
            let mut device = select_device(conn, id)?.ok_or(StorageError::DeviceNotFound(id))?;
            update.apply(&mut device);
            conn.execute(
                r#"
                UPDATE devices SET name = ?2, unique_id = ?3, broker = ?4, protocol = ?5,
                                   topic = ?6, username = ?7, password = ?8, description = ?9
                WHERE id = ?1
                "#,
                params![
                    id,
                    device.name,
                    device.unique_id,
                    device.broker,
                    device.protocol,
                    device.topic,
                    device.username,
                    device.password,
                    device.description,
                ],
            )?;
            Ok(device)
        })
        .await
    }

    async fn update_device_status(
        &self,
        id: i64,
        status: DeviceStatus,
    ) -> Result<Option<Device>, StorageError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE devices SET status = ?2, last_seen = ?3 WHERE id = ?1",
                params![id, status.as_str(), now_text()],
            )?;
            if changed == 0 {
                warn!("Device {} not found during status update (likely deleted)", id);
                return Ok(None);
            }
            select_device(conn, id)
        })
        .await
    }

    async fn delete_device(&self, id: i64) -> Result<(), StorageError> {
        self.run(move |conn| {
            conn.execute("DELETE FROM readings WHERE device_id = ?1", params![id])?;
            conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// Inserts a reading and trims old ones based on `max_readings_per_device`.
    async fn add_reading(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let retention = self.max_readings_per_device;
        self.run(move |conn| {
            let timestamp = OffsetDateTime::now_utc();
            conn.execute(
                "INSERT INTO readings (device_id, type, value, unit, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    reading.device_id,
                    reading.kind,
                    reading.value,
                    reading.unit,
                    format_timestamp(timestamp),
                ],
            )?;
            let id = conn.last_insert_rowid();

            if let Some(limit) = retention {
                conn.execute(
                    "DELETE FROM readings
                     WHERE device_id = ?1 AND id NOT IN (
                         SELECT id FROM readings
                         WHERE device_id = ?1
                         ORDER BY id DESC
                         LIMIT ?2
                     )",
                    params![reading.device_id, limit as i64],
                )?;
            }

            Ok(Reading {
                id,
                device_id: reading.device_id,
                kind: reading.kind,
                value: reading.value,
                unit: reading.unit,
                timestamp,
            })
        })
        .await
    }

    async fn get_readings(&self, device_id: i64, limit: usize) -> Result<Vec<Reading>, StorageError> {
        self.run(move |conn| {
            query_readings(
                conn,
                "SELECT id, device_id, type, value, unit, timestamp FROM readings
                 WHERE device_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
                params![device_id, limit as i64],
            )
        })
        .await
    }

    async fn get_recent_readings(
        &self,
        viewer: &Viewer,
        limit: usize,
    ) -> Result<Vec<Reading>, StorageError> {
        let viewer = viewer.clone();
        self.run(move |conn| {
            if viewer.is_admin() {
                query_readings(
                    conn,
                    "SELECT id, device_id, type, value, unit, timestamp FROM readings
                     ORDER BY id DESC
                     LIMIT ?1",
                    params![limit as i64],
                )
            } else {
                query_readings(
                    conn,
                    "SELECT r.id, r.device_id, r.type, r.value, r.unit, r.timestamp
                     FROM readings r
                     INNER JOIN devices d ON d.id = r.device_id
                     WHERE d.owner_id = ?1
                     ORDER BY r.id DESC
                     LIMIT ?2",
                    params![viewer.user_id, limit as i64],
                )
            }
        })
        .await
    }

    async fn find_user_by_token(&self, token: &str) -> Result<Option<User>, StorageError> {
        let token = token.to_string();
        self.run(move |conn| select_user(conn, "api_token", &token)).await
    }

    /// Adds the user, or updates role and token of an existing one with the same name.
    /// Returns the stored account, which keeps its original id.
    async fn ensure_user(&self, user: User) -> Result<User, StorageError> {
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO users (id, username, role, api_token)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(username) DO UPDATE SET
                    role = excluded.role,
                    api_token = excluded.api_token
                "#,
                params![user.id, user.username, user.role.as_str(), user.api_token],
            )?;
            select_user(conn, "username", &user.username)?.ok_or(StorageError::Corrupt {
                column: "users.username",
                value: user.username,
            })
        })
        .await
    }
}

fn select_user(conn: &Connection, column: &str, value: &str) -> Result<Option<User>, StorageError> {
    let sql = format!("SELECT id, username, role, api_token FROM users WHERE {} = ?1", column);
    let row = conn
        .query_row(&sql, params![value], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()?;

    match row {
        Some((id, username, role, api_token)) => {
            let role = role.parse::<Role>().map_err(|_| StorageError::Corrupt {
                column: "users.role",
                value: role.clone(),
            })?;
            Ok(Some(User {
                id,
                username,
                role,
                api_token,
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(retention: Option<usize>) -> (TempDir, DatabaseService) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.db");
        let db = DatabaseService::new(path.to_str().unwrap(), 2, retention).unwrap();
        db.initialize_db().unwrap();
        (dir, db)
    }

    fn new_device(name: &str) -> NewDevice {
        NewDevice {
            name: name.to_string(),
            broker: Some("host:1883".to_string()),
            topic: Some("t".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        }
    }

    fn reading(device_id: i64, value: f64) -> NewReading {
        NewReading {
            device_id,
            kind: "temp".into(),
            value,
            unit: "C".into(),
        }
    }

    #[tokio::test]
    async fn device_lifecycle_round_trips() {
        let (_dir, db) = open(None);
        let created = db.create_device("u1", new_device("boiler")).await.unwrap();
        assert_eq!(created.status, DeviceStatus::Offline);
        assert_eq!(created.protocol.as_deref(), Some("mqtt"));
        assert_eq!(created.password.as_deref(), Some("pw"));
        assert!(created.last_seen.is_some());

        let updated = db
            .update_device(
                created.id,
                DeviceUpdate {
                    topic: Some("plant/boiler".into()),
                    description: Some("basement".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.topic.as_deref(), Some("plant/boiler"));

        let status = db
            .update_device_status(created.id, DeviceStatus::Connected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, DeviceStatus::Connected);

        let fetched = db.get_device(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.description.as_deref(), Some("basement"));
        assert_eq!(fetched.status, DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn devices_are_scoped_to_owner_unless_admin() {
        let (_dir, db) = open(None);
        db.create_device("u1", new_device("a")).await.unwrap();
        db.create_device("u2", new_device("b")).await.unwrap();

        let own = db
            .get_devices(&Viewer { user_id: "u1".into(), role: Role::User })
            .await
            .unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].name, "a");
        assert_eq!(db.get_devices(&Viewer::system()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_update_of_missing_device_is_a_no_op() {
        let (_dir, db) = open(None);
        let result = db.update_device_status(404, DeviceStatus::Error).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn readings_are_trimmed_per_device() {
        let (_dir, db) = open(Some(2));
        let a = db.create_device("u1", new_device("a")).await.unwrap();
        let b = db.create_device("u2", new_device("b")).await.unwrap();
        for i in 0..4 {
            db.add_reading(reading(a.id, i as f64)).await.unwrap();
        }
        db.add_reading(reading(b.id, 9.0)).await.unwrap();

        let values: Vec<f64> = db
            .get_readings(a.id, 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![3.0, 2.0]);

        let theirs = db
            .get_recent_readings(&Viewer { user_id: "u2".into(), role: Role::User }, 10)
            .await
            .unwrap();
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].value, 9.0);
        assert_eq!(db.get_recent_readings(&Viewer::system(), 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn deleting_a_device_removes_its_readings() {
        let (_dir, db) = open(None);
        let a = db.create_device("u1", new_device("a")).await.unwrap();
        db.add_reading(reading(a.id, 1.0)).await.unwrap();
        db.delete_device(a.id).await.unwrap();

        assert!(db.get_device(a.id).await.unwrap().is_none());
        assert!(db.get_recent_readings(&Viewer::system(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent_and_rotates_token() {
        let (_dir, db) = open(None);
        let admin = User {
            id: "id-1".into(),
            username: "admin".into(),
            role: Role::Admin,
            api_token: "first".into(),
        };
        db.ensure_user(admin.clone()).await.unwrap();
        let stored = db
            .ensure_user(User { id: "id-2".into(), api_token: "second".into(), ..admin })
            .await
            .unwrap();
        assert_eq!(stored.id, "id-1");

        assert!(db.find_user_by_token("first").await.unwrap().is_none());
        let found = db.find_user_by_token("second").await.unwrap().unwrap();
        assert_eq!(found.id, "id-1");
        assert_eq!(found.role, Role::Admin);
    }
}
