//! SQLite-backed registry store.
//!
//! Lives inside the chat client's existing database. The `remote_profiles`
//! migration adds the `remote_devices` table and attaches two columns to
//! the engine's `users` table; removing a device row cascades to the users
//! it announced. The connection sits behind one async mutex because the
//! chat store is a single-writer resource and the registry shares that
//! discipline.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::store::{
    DeviceId, DeviceStatus, RegistryStore, RemoteDevice, StoreError, UserBinding, UserId,
};

/// Name of the migration this module owns, recorded in the ledger table.
pub const MIGRATION_REMOTE_PROFILES: &str = "remote_profiles";

const MIGRATION_UP: &str = r#"
CREATE TABLE remote_devices (
  remote_device_id INTEGER PRIMARY KEY AUTOINCREMENT,
  device_name        TEXT NOT NULL,
  device_status      TEXT NOT NULL,
  device_public_key  BLOB NOT NULL,
  local_private_key  BLOB NOT NULL,
  local_public_key   BLOB NOT NULL,
  created_at         TEXT NOT NULL DEFAULT(datetime('now')),
  updated_at         TEXT NOT NULL DEFAULT(datetime('now'))
);
ALTER TABLE users ADD COLUMN remote_device_id INTEGER
    REFERENCES remote_devices ON DELETE CASCADE;
ALTER TABLE users ADD COLUMN remote_user_id INTEGER;
CREATE INDEX idx_users_remote_device_id ON users(remote_device_id);
"#;

/// Reversal of [`MIGRATION_UP`], kept alongside it the way every other chat
/// store migration pairs its directions.
pub const MIGRATION_DOWN: &str = r#"
DROP INDEX idx_users_remote_device_id;
ALTER TABLE users DROP COLUMN remote_user_id;
ALTER TABLE users DROP COLUMN remote_device_id;
DROP TABLE remote_devices;
"#;

/// Durable registry store over the chat database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the migration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::OperationFailed(format!("open database: {e}")))?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::OperationFailed(format!("open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| StoreError::OperationFailed(format!("set pragmas: {e}")))?;
        Self::run_migrations(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (name TEXT PRIMARY KEY)",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("create migrations ledger: {e}")))?;

        // The chat engine owns `users`; standing in for its base schema
        // keeps this store usable against a fresh file.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL DEFAULT ''
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("create users table: {e}")))?;

        let applied: Option<String> = conn
            .query_row(
                "SELECT name FROM migrations WHERE name = ?1",
                params![MIGRATION_REMOTE_PROFILES],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::OperationFailed(format!("read migrations ledger: {e}")))?;
        if applied.is_some() {
            return Ok(());
        }

        conn.execute_batch(MIGRATION_UP)
            .map_err(|e| StoreError::OperationFailed(format!("apply remote_profiles: {e}")))?;
        conn.execute(
            "INSERT INTO migrations (name) VALUES (?1)",
            params![MIGRATION_REMOTE_PROFILES],
        )
        .map_err(|e| StoreError::OperationFailed(format!("record remote_profiles: {e}")))?;
        Ok(())
    }

    /// Seed a plain local user row; tests stand in for the chat engine here.
    pub async fn add_user(&self, display_name: &str) -> Result<UserId, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (display_name) VALUES (?1)",
            params![display_name],
        )
        .map_err(|e| StoreError::OperationFailed(format!("insert user: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<UserBinding>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT user_id, remote_device_id, remote_user_id FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(UserBinding {
                    user_id: row.get(0)?,
                    remote_device_id: row.get(1)?,
                    remote_user_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| StoreError::OperationFailed(format!("load user: {e}")))
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RemoteDevice, String)> {
    let status: String = row.get(2)?;
    Ok((
        RemoteDevice {
            id: row.get(0)?,
            name: row.get(1)?,
            status: DeviceStatus::Pending, // patched by the caller
            device_public_key: row.get(3)?,
            local_private_key: row.get(4)?,
            local_public_key: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        },
        status,
    ))
}

fn finish_device((mut device, status): (RemoteDevice, String)) -> Result<RemoteDevice, StoreError> {
    device.status = DeviceStatus::parse(&status)?;
    Ok(device)
}

const DEVICE_COLUMNS: &str = "remote_device_id, device_name, device_status, \
     device_public_key, local_private_key, local_public_key, created_at, updated_at";

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn insert_device(
        &self,
        name: &str,
        device_public_key: &[u8],
        local_private_key: &[u8],
        local_public_key: &[u8],
    ) -> Result<DeviceId, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO remote_devices
                (device_name, device_status, device_public_key, local_private_key, local_public_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                DeviceStatus::Pending.as_str(),
                device_public_key,
                local_private_key,
                local_public_key,
            ],
        )
        .map_err(|e| StoreError::OperationFailed(format!("insert device: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn device_by_id(&self, id: DeviceId) -> Result<Option<RemoteDevice>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM remote_devices WHERE remote_device_id = ?1"),
            params![id],
            row_to_device,
        )
        .optional()
        .map_err(|e| StoreError::OperationFailed(format!("load device: {e}")))?
        .map(finish_device)
        .transpose()
    }

    async fn device_by_public_key(&self, key: &[u8]) -> Result<Option<RemoteDevice>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM remote_devices
                 WHERE device_public_key = ?1
                 ORDER BY remote_device_id DESC LIMIT 1"
            ),
            params![key],
            row_to_device,
        )
        .optional()
        .map_err(|e| StoreError::OperationFailed(format!("lookup device: {e}")))?
        .map(finish_device)
        .transpose()
    }

    async fn set_device_status(&self, id: DeviceId, status: DeviceStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE remote_devices
                 SET device_status = ?1, updated_at = datetime('now')
                 WHERE remote_device_id = ?2",
                params![status.as_str(), id],
            )
            .map_err(|e| StoreError::OperationFailed(format!("update device status: {e}")))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("remote device {id}")));
        }
        Ok(())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM remote_devices WHERE remote_device_id = ?1",
            params![id],
        )
        .map_err(|e| StoreError::OperationFailed(format!("delete device: {e}")))?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<RemoteDevice>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEVICE_COLUMNS} FROM remote_devices ORDER BY remote_device_id"
            ))
            .map_err(|e| StoreError::OperationFailed(format!("list devices: {e}")))?;
        let rows = stmt
            .query_map([], row_to_device)
            .map_err(|e| StoreError::OperationFailed(format!("list devices: {e}")))?;
        let mut devices = Vec::new();
        for row in rows {
            let pair = row.map_err(|e| StoreError::OperationFailed(format!("list devices: {e}")))?;
            devices.push(finish_device(pair)?);
        }
        Ok(devices)
    }

    async fn bind_user(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        remote_user_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE users SET remote_device_id = ?1, remote_user_id = ?2 WHERE user_id = ?3",
                params![device_id, remote_user_id, user_id],
            )
            .map_err(|e| StoreError::OperationFailed(format!("bind user: {e}")))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn users_for_device(&self, device_id: DeviceId) -> Result<Vec<UserBinding>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, remote_device_id, remote_user_id FROM users
                 WHERE remote_device_id = ?1 ORDER BY user_id",
            )
            .map_err(|e| StoreError::OperationFailed(format!("list bound users: {e}")))?;
        let rows = stmt
            .query_map(params![device_id], |row| {
                Ok(UserBinding {
                    user_id: row.get(0)?,
                    remote_device_id: row.get(1)?,
                    remote_user_id: row.get(2)?,
                })
            })
            .map_err(|e| StoreError::OperationFailed(format!("list bound users: {e}")))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::OperationFailed(format!("list bound users: {e}")))
    }
}
