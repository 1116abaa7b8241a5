// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Exclusive leases on capture devices shared by the nodes of one graph.
//!
//! A camera or microphone can only be opened by one node at a time. Nodes take a
//! [`DeviceLease`] in `on_setup`; a second node asking for the same device gets
//! [`DeviceError::Busy`], which the engine reports as a resource error and keeps
//! the node out of the usable set. Dropping the lease frees the device.
//!
//! # Example
//!
//! ```rust
//! use nodeflow_core::devices::DeviceRegistry;
//!
//! let devices = DeviceRegistry::new();
//! let lease = devices.acquire("camera:0", "cam_a").unwrap();
//! assert!(devices.acquire("camera:0", "cam_b").is_err());
//! drop(lease);
//! assert!(devices.acquire("camera:0", "cam_b").is_ok());
//! ```

use crate::error::NodeFlowError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Errors from the device registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device '{device}' is in use by '{owner}'")]
    Busy { device: String, owner: String },

    #[error("Device registry state is poisoned")]
    Poisoned,
}

impl From<DeviceError> for NodeFlowError {
    fn from(err: DeviceError) -> Self {
        Self::Resource(err.to_string())
    }
}

struct LeaseEntry {
    owner: String,
    generation: u64,
}

#[derive(Default)]
struct RegistryInner {
    leases: Mutex<HashMap<String, LeaseEntry>>,
    generation: AtomicU64,
}

/// Tracks which node holds which device. Cheap to clone.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry").field("leases", &self.snapshot()).finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an exclusive lease on `device` for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Busy`] if another lease is outstanding.
    pub fn acquire(&self, device: &str, owner: &str) -> Result<DeviceLease, DeviceError> {
        let Ok(mut leases) = self.inner.leases.lock() else {
            return Err(DeviceError::Poisoned);
        };
        if let Some(entry) = leases.get(device) {
            return Err(DeviceError::Busy { device: device.to_string(), owner: entry.owner.clone() });
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        leases.insert(device.to_string(), LeaseEntry { owner: owner.to_string(), generation });
        drop(leases);

        tracing::debug!(device, owner, "Device lease acquired");
        Ok(DeviceLease {
            registry: Arc::clone(&self.inner),
            device: device.to_string(),
            generation,
        })
    }

    /// Current holder of `device`, if any.
    pub fn owner_of(&self, device: &str) -> Option<String> {
        self.inner.leases.lock().ok()?.get(device).map(|entry| entry.owner.clone())
    }

    /// Forgets every outstanding lease.
    ///
    /// Leases dropped afterwards leave newer leases on the same device untouched.
    pub fn release_all(&self) {
        let count = self.inner.leases.lock().map_or(0, |mut leases| {
            let count = leases.len();
            leases.clear();
            count
        });
        if count > 0 {
            tracing::info!("Released {} device lease(s)", count);
        }
    }

    /// `(device, owner)` pairs, sorted by device.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self.inner.leases.lock().map_or_else(
            |_| Vec::new(),
            |leases| leases.iter().map(|(d, e)| (d.clone(), e.owner.clone())).collect(),
        );
        pairs.sort();
        pairs
    }
}

/// An exclusive hold on one device; released on drop.
#[must_use = "the device is freed as soon as the lease is dropped"]
pub struct DeviceLease {
    registry: Arc<RegistryInner>,
    device: String,
    generation: u64,
}

impl DeviceLease {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease").field("device", &self.device).finish_non_exhaustive()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let Ok(mut leases) = self.registry.leases.lock() else {
            return;
        };
        if leases.get(&self.device).is_some_and(|entry| entry.generation == self.generation) {
            leases.remove(&self.device);
            tracing::debug!(device = %self.device, "Device lease released");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_lease() {
        let devices = DeviceRegistry::new();
        let lease = devices.acquire("mic:1", "a").unwrap();
        assert_eq!(lease.device(), "mic:1");

        let err = devices.acquire("mic:1", "b").unwrap_err();
        assert_eq!(err, DeviceError::Busy { device: "mic:1".into(), owner: "a".into() });
        assert_eq!(devices.owner_of("mic:1").as_deref(), Some("a"));

        drop(lease);
        assert!(devices.owner_of("mic:1").is_none());
    }

    #[test]
    fn test_busy_maps_to_resource_error() {
        let devices = DeviceRegistry::new();
        let _lease = devices.acquire("camera:0", "a").unwrap();
        let err: NodeFlowError = devices.acquire("camera:0", "b").unwrap_err().into();
        assert!(matches!(err, NodeFlowError::Resource(_)));
    }

    #[test]
    fn test_stale_lease_does_not_free_newer_one() {
        let devices = DeviceRegistry::new();
        let stale = devices.acquire("camera:0", "a").unwrap();
        devices.release_all();

        let fresh = devices.acquire("camera:0", "b").unwrap();
        drop(stale);
        assert_eq!(devices.snapshot(), vec![("camera:0".to_string(), "b".to_string())]);
        drop(fresh);
        assert!(devices.snapshot().is_empty());
    }
}
