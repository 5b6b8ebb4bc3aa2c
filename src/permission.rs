//! Per-device authorization handshake

use crate::device::DeviceRef;
use crate::error::{Error, Result};
use crate::plugin::SharedPlugin;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Where a device stands in the authorization handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    /// No request issued yet
    Unrequested,
    /// Request issued, no grant observed
    Requested,
    /// Access granted
    Granted,
    /// Polling budget ran out without a grant.
    ///
    /// The native layer cannot tell a timeout from an explicit refusal, so
    /// this is the single "not authorized" outcome.
    DeniedPending,
}

/// Polling schedule for [`PermissionGate::authorize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionPolicy {
    /// Wait between polls
    pub poll_interval: Duration,
    /// Polls before giving up
    pub max_polls: u32,
    /// Re-issue the request after every n-th unsuccessful poll
    pub rerequest_every: u32,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_polls: 6,
            rerequest_every: 2,
        }
    }
}

/// Authorization handshake shared by all slots
pub struct PermissionGate {
    plugin: SharedPlugin,
    policy: PermissionPolicy,
    states: Mutex<HashMap<DeviceRef, PermissionState>>,
}

impl PermissionGate {
    /// Create a gate over the shared plugin
    pub fn new(plugin: SharedPlugin, policy: PermissionPolicy) -> Self {
        Self {
            plugin,
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Polling schedule in use
    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Current handshake state of a device
    pub fn state(&self, device: &DeviceRef) -> PermissionState {
        self.states
            .lock()
            .expect("permission mutex poisoned")
            .get(device)
            .copied()
            .unwrap_or(PermissionState::Unrequested)
    }

    fn set_state(&self, device: &DeviceRef, state: PermissionState) {
        self.states
            .lock()
            .expect("permission mutex poisoned")
            .insert(device.clone(), state);
    }

    /// Forget a device so the next handshake starts from scratch
    pub fn reset(&self, device: &DeviceRef) {
        self.states
            .lock()
            .expect("permission mutex poisoned")
            .remove(device);
    }

    /// Issue an authorization request unless one is already outstanding
    ///
    /// Returns whether a request was sent. Failing to send is logged and
    /// leaves the device pending.
    pub async fn request(&self, device: &DeviceRef) -> bool {
        match self.state(device) {
            PermissionState::Requested | PermissionState::Granted => false,
            PermissionState::Unrequested | PermissionState::DeniedPending => {
                self.set_state(device, PermissionState::Requested);
                self.issue(device).await;
                true
            }
        }
    }

    async fn issue(&self, device: &DeviceRef) {
        match self.plugin.obtain_permission(device).await {
            Ok(()) => tracing::debug!(%device, "Permission requested"),
            Err(err) => tracing::warn!(%device, error = %err, "Permission request failed"),
        }
    }

    /// Ask the native layer whether access is granted
    pub async fn poll(&self, device: &DeviceRef) -> Result<bool> {
        let granted = self
            .plugin
            .has_permission(device)
            .await
            .map_err(|e| Error::PermissionQuery {
                device: device.to_string(),
                reason: e.to_string(),
            })?;
        if granted {
            self.set_state(device, PermissionState::Granted);
        }
        Ok(granted)
    }

    async fn poll_lenient(&self, device: &DeviceRef) -> bool {
        match self.poll(device).await {
            Ok(granted) => granted,
            Err(err) => {
                tracing::warn!(%device, error = %err, "Permission query failed");
                false
            }
        }
    }

    /// Run the full handshake and return its terminal state
    ///
    /// Requests access, then polls on the configured interval, re-requesting
    /// periodically in case the first request was dropped. After the last
    /// wait one confirming poll decides between `Granted` and
    /// `DeniedPending`.
    pub async fn authorize(&self, device: &DeviceRef) -> PermissionState {
        let policy = self.policy;
        self.request(device).await;

        for attempt in 1..=policy.max_polls {
            if self.poll_lenient(device).await {
                tracing::info!(%device, attempt, "Permission granted");
                return PermissionState::Granted;
            }

            tracing::debug!(%device, attempt, max = policy.max_polls, "Waiting for permission");
            if policy.rerequest_every > 0 && attempt % policy.rerequest_every == 0 {
                tracing::debug!(%device, "Re-issuing permission request");
                self.issue(device).await;
            }

            tokio::time::sleep(policy.poll_interval).await;
        }

        if self.poll_lenient(device).await {
            tracing::info!(%device, "Permission granted");
            return PermissionState::Granted;
        }

        tracing::warn!(%device, polls = policy.max_polls, "Permission not granted");
        self.set_state(device, PermissionState::DeniedPending);
        PermissionState::DeniedPending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{PermissionBehavior, SimulatedDevice, SimulatedPlugin};
    use std::sync::Arc;

    fn gate_with(behavior: PermissionBehavior) -> (Arc<SimulatedPlugin>, PermissionGate) {
        let plugin = Arc::new(SimulatedPlugin::new());
        plugin.attach(SimulatedDevice::new("cam").with_permission(behavior));
        let gate = PermissionGate::new(plugin.clone(), PermissionPolicy::default());
        (plugin, gate)
    }

    #[tokio::test]
    async fn test_request_is_idempotent() {
        let (plugin, gate) = gate_with(PermissionBehavior::Never);
        let cam = DeviceRef::from("cam");

        assert!(gate.request(&cam).await);
        assert!(!gate.request(&cam).await);
        assert_eq!(gate.state(&cam), PermissionState::Requested);
        assert_eq!(plugin.device_calls("cam").obtain_permission, 1);
    }

    #[tokio::test]
    async fn test_granted_immediately() {
        let (plugin, gate) = gate_with(PermissionBehavior::Granted);
        let cam = DeviceRef::from("cam");

        assert_eq!(gate.authorize(&cam).await, PermissionState::Granted);
        assert_eq!(gate.state(&cam), PermissionState::Granted);
        assert_eq!(plugin.device_calls("cam").has_permission, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_denied_pending() {
        let (plugin, gate) = gate_with(PermissionBehavior::Never);
        let cam = DeviceRef::from("cam");
        let started = tokio::time::Instant::now();

        assert_eq!(gate.authorize(&cam).await, PermissionState::DeniedPending);

        let calls = plugin.device_calls("cam");
        assert_eq!(calls.has_permission, 7);
        // initial request plus one after polls 2, 4 and 6
        assert_eq!(calls.obtain_permission, 4);
        assert!(started.elapsed() >= Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerequest_rescues_dropped_request() {
        let (_plugin, gate) = gate_with(PermissionBehavior::AfterRequests(2));
        let cam = DeviceRef::from("cam");
        assert_eq!(gate.authorize(&cam).await, PermissionState::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_failures_count_as_pending() {
        let (plugin, gate) = gate_with(PermissionBehavior::QueryFails);
        let cam = DeviceRef::from("cam");

        assert!(matches!(gate.poll(&cam).await, Err(Error::PermissionQuery { .. })));
        assert_eq!(gate.authorize(&cam).await, PermissionState::DeniedPending);
        assert_eq!(plugin.device_calls("cam").has_permission, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_starts_fresh_cycle() {
        let (plugin, gate) = gate_with(PermissionBehavior::AfterPolls(3));
        let cam = DeviceRef::from("cam");

        assert_eq!(gate.authorize(&cam).await, PermissionState::Granted);
        gate.reset(&cam);
        assert_eq!(gate.state(&cam), PermissionState::Unrequested);
        assert!(gate.request(&cam).await);
        assert_eq!(plugin.device_calls("cam").obtain_permission, 3);
    }
}
