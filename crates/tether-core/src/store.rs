//! Registry storage abstraction.
//!
//! The `RegistryStore` trait hides whether device bindings live in the chat
//! client's SQLite database or in memory. The in-memory implementation
//! backs tests and first-run flows; the durable one lives in
//! [`crate::sqlite`].
//!
//! Whatever the backend, all writes funnel through one serialized writer:
//! the host's own chat UI shares the same database and the same lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Row id of a registered remote device.
pub type DeviceId = i64;

/// Row id of a chat user profile.
pub type UserId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

/// Lifecycle status of a remote device binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Registered, awaiting the host user's approval.
    Pending,
    /// Approved; handshakes against this binding are accepted.
    Active,
    /// Deregistered; handshakes against this binding are refused.
    Revoked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(DeviceStatus::Pending),
            "active" => Ok(DeviceStatus::Active),
            "revoked" => Ok(DeviceStatus::Revoked),
            other => Err(StoreError::OperationFailed(format!("unknown device status {other:?}"))),
        }
    }
}

/// A persisted remote device binding.
///
/// The pair (`device_public_key`, `local_public_key`) identifies the
/// binding across restarts; both private halves of the host pair stay
/// opaque bytes at this layer.
#[derive(Clone, Debug)]
pub struct RemoteDevice {
    pub id: DeviceId,
    pub name: String,
    pub status: DeviceStatus,
    pub device_public_key: Vec<u8>,
    pub local_private_key: Vec<u8>,
    pub local_public_key: Vec<u8>,
    pub created_at: String,
    pub updated_at: String,
}

/// The remote columns of a chat user row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserBinding {
    pub user_id: UserId,
    /// Owning device; `None` for purely local users.
    pub remote_device_id: Option<DeviceId>,
    /// The id the satellite uses for this user locally.
    pub remote_user_id: Option<i64>,
}

/// Seconds-precision wall clock string for store timestamps.
pub(crate) fn now_stamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs.to_string()
}

/// Persistence operations the registry needs.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Insert a device row in `pending` status, returning its id.
    async fn insert_device(
        &self,
        name: &str,
        device_public_key: &[u8],
        local_private_key: &[u8],
        local_public_key: &[u8],
    ) -> Result<DeviceId, StoreError>;

    async fn device_by_id(&self, id: DeviceId) -> Result<Option<RemoteDevice>, StoreError>;

    /// Most recent row carrying this device public key, any status.
    async fn device_by_public_key(&self, key: &[u8]) -> Result<Option<RemoteDevice>, StoreError>;

    /// Update status and touch `updated_at`.
    async fn set_device_status(&self, id: DeviceId, status: DeviceStatus) -> Result<(), StoreError>;

    /// Remove the row. Users bound to it go with it.
    async fn delete_device(&self, id: DeviceId) -> Result<(), StoreError>;

    async fn list_devices(&self) -> Result<Vec<RemoteDevice>, StoreError>;

    /// Attach the remote columns to an existing user row.
    async fn bind_user(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        remote_user_id: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn users_for_device(&self, device_id: DeviceId) -> Result<Vec<UserBinding>, StoreError>;
}

/// In-memory store for tests and ephemeral profiles.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    next_device_id: DeviceId,
    devices: HashMap<DeviceId, RemoteDevice>,
    users: HashMap<UserId, UserBinding>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a plain local user row, mirroring what the chat store owns.
    pub async fn add_user(&self, user_id: UserId) {
        let mut inner = self.inner.write().await;
        inner.users.insert(
            user_id,
            UserBinding { user_id, remote_device_id: None, remote_user_id: None },
        );
    }

    pub async fn user(&self, user_id: UserId) -> Option<UserBinding> {
        self.inner.read().await.users.get(&user_id).cloned()
    }
}

#[async_trait]
impl RegistryStore for InMemoryStore {
    async fn insert_device(
        &self,
        name: &str,
        device_public_key: &[u8],
        local_private_key: &[u8],
        local_public_key: &[u8],
    ) -> Result<DeviceId, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_device_id += 1;
        let id = inner.next_device_id;
        let stamp = now_stamp();
        inner.devices.insert(
            id,
            RemoteDevice {
                id,
                name: name.to_string(),
                status: DeviceStatus::Pending,
                device_public_key: device_public_key.to_vec(),
                local_private_key: local_private_key.to_vec(),
                local_public_key: local_public_key.to_vec(),
                created_at: stamp.clone(),
                updated_at: stamp,
            },
        );
        Ok(id)
    }

    async fn device_by_id(&self, id: DeviceId) -> Result<Option<RemoteDevice>, StoreError> {
        Ok(self.inner.read().await.devices.get(&id).cloned())
    }

    async fn device_by_public_key(&self, key: &[u8]) -> Result<Option<RemoteDevice>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .values()
            .filter(|d| d.device_public_key == key)
            .max_by_key(|d| d.id)
            .cloned())
    }

    async fn set_device_status(&self, id: DeviceId, status: DeviceStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.devices.get_mut(&id) {
            Some(device) => {
                device.status = status;
                device.updated_at = now_stamp();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("remote device {id}"))),
        }
    }

    async fn delete_device(&self, id: DeviceId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.devices.remove(&id);
        inner.users.retain(|_, u| u.remote_device_id != Some(id));
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<RemoteDevice>, StoreError> {
        let inner = self.inner.read().await;
        let mut devices: Vec<_> = inner.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn bind_user(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        remote_user_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.devices.contains_key(&device_id) {
            return Err(StoreError::NotFound(format!("remote device {device_id}")));
        }
        match inner.users.get_mut(&user_id) {
            Some(user) => {
                user.remote_device_id = Some(device_id);
                user.remote_user_id = remote_user_id;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("user {user_id}"))),
        }
    }

    async fn users_for_device(&self, device_id: DeviceId) -> Result<Vec<UserBinding>, StoreError> {
        let inner = self.inner.read().await;
        let mut users: Vec<_> = inner
            .users
            .values()
            .filter(|u| u.remote_device_id == Some(device_id))
            .cloned()
            .collect();
        users.sort_by_key(|u| u.user_id);
        Ok(users)
    }
}
