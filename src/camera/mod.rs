//! V4L2 camera backend for Linux
//!
//! Exposes `/dev/video*` capture nodes through [`CameraPlugin`](crate::plugin::CameraPlugin).
//! Devices are named by their node path, which stays stable while the
//! camera is plugged in.

mod backend;

pub use backend::V4lPlugin;

use serde::{Deserialize, Serialize};

/// Highest `/dev/videoN` index probed during enumeration
pub const MAX_NODE_INDEX: usize = 16;

/// Information about a V4L2 capture node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureNode {
    /// Node index (e.g., 0 for /dev/video0)
    pub index: usize,
    /// Node path (e.g., "/dev/video0")
    pub path: String,
    /// Card name reported by the driver
    pub card: String,
    /// Driver name
    pub driver: String,
    /// Bus information
    pub bus_info: String,
}

/// List V4L2 nodes that can capture video
pub fn list_capture_nodes() -> Vec<CaptureNode> {
    let mut nodes = Vec::new();

    for index in 0..MAX_NODE_INDEX {
        let Ok(dev) = v4l::Device::new(index) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // UVC cameras expose a metadata node next to the capture node
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            continue;
        }

        nodes.push(CaptureNode {
            index,
            path: node_path(index),
            card: caps.card,
            driver: caps.driver,
            bus_info: caps.bus,
        });
    }

    nodes
}

/// Device path of node `index`
pub fn node_path(index: usize) -> String {
    format!("/dev/video{index}")
}

/// Node index encoded in a `/dev/videoN` path
pub fn node_index(path: &str) -> Option<usize> {
    path.strip_prefix("/dev/video")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_index_round_trip() {
        assert_eq!(node_index(&node_path(3)), Some(3));
        assert_eq!(node_index("/dev/video"), None);
        assert_eq!(node_index("/dev/sda"), None);
    }

    #[test]
    fn test_list_capture_nodes() {
        // Only finds something on hosts with cameras attached
        for node in list_capture_nodes() {
            assert!(node.path.starts_with("/dev/video"));
        }
    }
}
