//! C3 — Device Router: dispatches inbound frames to every device whose
//! `accepts(...)` returns true. O(N) per frame, N small (<=255), no
//! uniqueness enforcement — mirrors `CanDeviceManager::onCanFrame`.

pub mod relay;

use crate::can::transport::RawFrame;
use relay::{RelayDevice, StatusUpdated};
use std::collections::HashMap;

/// Ordered registry of device node ids. Dispatch itself walks a
/// caller-supplied device map so the router never needs to hold (or
/// borrow-conflict with) the devices themselves.
#[derive(Debug, Default)]
pub struct DeviceRouter {
    order: Vec<u32>,
}

impl DeviceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_id: u32) {
        if !self.order.contains(&node_id) {
            self.order.push(node_id);
        }
    }

    pub fn unregister(&mut self, node_id: u32) {
        self.order.retain(|&n| n != node_id);
    }

    /// Deliver `frame` to every registered device that accepts it.
    /// Returns the status-update events raised by whichever device(s)
    /// matched.
    pub fn dispatch(
        &self,
        frame: &RawFrame,
        devices: &mut HashMap<u32, RelayDevice>,
        now_ms: i64,
    ) -> Vec<StatusUpdated> {
        let mut events = Vec::new();
        for node_id in &self.order {
            if let Some(device) = devices.get_mut(node_id) {
                if device.accepts(frame.can_id, frame.extended, frame.rtr) {
                    events.extend(device.on_frame(frame.payload(), now_ms));
                }
            }
        }
        events
    }
}
