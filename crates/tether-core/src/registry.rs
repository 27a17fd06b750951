//! Device registry.
//!
//! Binds remote devices to this host. Each binding stores the satellite's
//! long-lived public key next to a host key pair minted for that binding
//! alone, so revoking one satellite never touches another's keys.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use tether_crypto::{IdentityKey, KeyError, PublicIdentity};

use crate::store::{DeviceId, DeviceStatus, RegistryStore, RemoteDevice, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device public key already has an active binding")]
    DuplicateDevice,

    #[error("remote device not found")]
    NotFound,

    #[error("remote device revoked")]
    Revoked,

    #[error("stored key material is unusable: {0}")]
    BadKeyMaterial(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistryError> for crate::errors::SatelliteError {
    fn from(e: RegistryError) -> Self {
        use crate::errors::SatelliteError;
        match e {
            RegistryError::DuplicateDevice => {
                SatelliteError::HandshakeReject("device already bound".into())
            }
            RegistryError::NotFound => SatelliteError::DeviceUnknown,
            RegistryError::Revoked => SatelliteError::DeviceRevoked,
            RegistryError::BadKeyMaterial(k) => SatelliteError::HandshakeReject(k.to_string()),
            RegistryError::Store(s) => SatelliteError::Store(s),
        }
    }
}

/// Outcome of [`DeviceRegistry::register`].
pub struct Registration {
    pub device_id: DeviceId,
    /// Public half of the host pair minted for this binding.
    pub host_public_key: PublicIdentity,
}

/// Registry facade over the shared store.
#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn RegistryStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    /// Record a new device in `pending` status with a fresh host key pair.
    pub async fn register(
        &self,
        name: &str,
        device_public_key: &[u8],
    ) -> Result<Registration, RegistryError> {
        if let Some(existing) = self.store.device_by_public_key(device_public_key).await? {
            if existing.status == DeviceStatus::Active {
                return Err(RegistryError::DuplicateDevice);
            }
        }

        let host_key = IdentityKey::generate();
        let host_public = host_key.public();
        let device_id = self
            .store
            .insert_device(
                name,
                device_public_key,
                host_key.to_bytes().as_ref(),
                host_public.as_bytes(),
            )
            .await?;

        info!(device_id, device = name, "remote device registered");
        Ok(Registration { device_id, host_public_key: host_public })
    }

    /// Approve a pending binding.
    pub async fn confirm(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        self.store.set_device_status(device_id, DeviceStatus::Active).await?;
        info!(device_id, "remote device confirmed");
        Ok(())
    }

    /// Refuse a pending binding; the row disappears entirely.
    pub async fn reject(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        self.store.delete_device(device_id).await?;
        info!(device_id, "remote device rejected");
        Ok(())
    }

    /// Resolve the binding a reconnecting satellite claims.
    ///
    /// Only `active` rows authenticate; a revoked row is a distinct failure
    /// so the satellite user learns the binding was deliberately severed.
    pub async fn lookup(&self, device_public_key: &[u8]) -> Result<RemoteDevice, RegistryError> {
        let device = self
            .store
            .device_by_public_key(device_public_key)
            .await?
            .ok_or(RegistryError::NotFound)?;
        match device.status {
            DeviceStatus::Active => Ok(device),
            DeviceStatus::Revoked => Err(RegistryError::Revoked),
            DeviceStatus::Pending => Err(RegistryError::NotFound),
        }
    }

    /// Sever a binding. The row stays for audit; open sessions are torn
    /// down by the controller on its next tick.
    pub async fn revoke(&self, device_id: DeviceId) -> Result<(), RegistryError> {
        self.store.set_device_status(device_id, DeviceStatus::Revoked).await?;
        info!(device_id, "remote device revoked");
        Ok(())
    }

    pub async fn device(&self, device_id: DeviceId) -> Result<RemoteDevice, RegistryError> {
        self.store
            .device_by_id(device_id)
            .await?
            .ok_or(RegistryError::NotFound)
    }

    /// Reconstruct the host identity minted for a binding.
    pub fn host_identity(&self, device: &RemoteDevice) -> Result<IdentityKey, RegistryError> {
        Ok(IdentityKey::from_bytes(&device.local_private_key)?)
    }
}
