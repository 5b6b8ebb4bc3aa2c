//! Device references and enumeration

use crate::error::{Error, Result};
use crate::plugin::SharedPlugin;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable handle naming one physical camera
///
/// Two references are the same device exactly when their names are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRef(String);

impl DeviceRef {
    /// Wrap a name returned by enumeration
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The device name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Live view of attached cameras
#[derive(Clone)]
pub struct DeviceDirectory {
    plugin: SharedPlugin,
}

impl DeviceDirectory {
    /// Create a directory backed by the shared plugin
    pub fn new(plugin: SharedPlugin) -> Self {
        Self { plugin }
    }

    /// Enumerate attached cameras in plugin order
    ///
    /// Blank names are dropped and repeated names keep their first position.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRef>> {
        let listed = self
            .plugin
            .list_usb_devices()
            .await
            .map_err(|e| Error::Enumeration(e.to_string()))?;

        let mut devices: Vec<DeviceRef> = Vec::with_capacity(listed.len());
        for device in listed {
            if device.name().trim().is_empty() || devices.contains(&device) {
                continue;
            }
            devices.push(device);
        }
        Ok(devices)
    }

    /// Poll until at least one camera shows up or `attempts` rounds pass
    ///
    /// Returns an empty list when nothing appeared; enumeration failures are
    /// logged and count as an empty round.
    pub async fn discover(&self, attempts: u32, interval: Duration) -> Vec<DeviceRef> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.list_devices().await {
                Ok(devices) if !devices.is_empty() => {
                    tracing::info!(count = devices.len(), "Discovered cameras");
                    return devices;
                }
                Ok(_) => {
                    tracing::debug!(attempt, attempts, "No cameras attached yet");
                }
                Err(err) => {
                    tracing::warn!(attempt, attempts, error = %err, "Camera enumeration failed");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        tracing::warn!(attempts, "No cameras found");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedDevice, SimulatedPlugin};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_devices_dedupes_names() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam-A"));
        plugin.attach(SimulatedDevice::new("cam-B"));
        plugin.attach(SimulatedDevice::new("cam-A"));

        let directory = DeviceDirectory::new(plugin);
        let devices = directory.list_devices().await.unwrap();
        assert_eq!(devices, vec![DeviceRef::from("cam-A"), DeviceRef::from("cam-B")]);
    }

    #[tokio::test]
    async fn test_list_devices_maps_failure() {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.fail_enumeration(true);

        let directory = DeviceDirectory::new(plugin);
        let err = directory.list_devices().await.unwrap_err();
        assert!(matches!(err, Error::Enumeration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_gives_up_after_attempts() {
        let plugin = Arc::new(SimulatedPlugin::new());
        let directory = DeviceDirectory::new(plugin.clone());

        let devices = directory.discover(4, Duration::from_secs(1)).await;
        assert!(devices.is_empty());
        assert_eq!(plugin.calls().list_usb_devices, 4);
    }
}
