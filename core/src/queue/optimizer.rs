//! C6 — Group/Batch Optimizer: collapses a batch of (node, channel, action)
//! writes into the minimum number of CAN frames, coalescing two or more
//! channel writes on the same node into a single `control_multi` frame.
//! Grounded on `GroupController::applyAll` batching path.

use crate::can::codec::Action;
use std::collections::BTreeMap;

/// What the queue needs from the device layer to fill in channels a batch
/// doesn't touch, and to reject writes aimed at unknown nodes.
pub trait DeviceLookup {
    fn exists(&self, node: u32) -> bool;
    fn last_action(&self, node: u32, channel: u8) -> Action;
}

/// A single frame-worth of work ready to hand to the CAN layer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedWrite {
    Single { node: u32, channel: u8, action: Action },
    Multi { node: u32, actions: [Action; 4] },
}

/// Before/after accounting for a batch optimization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub total: usize,
    pub accepted: usize,
    pub missing: usize,
    pub original_frames: usize,
    pub optimized_frames: usize,
}

/// Bucket `writes` by node (last write per channel wins within a node),
/// drop writes aimed at unregistered nodes, and coalesce any node touched
/// on 2+ channels into one `control_multi` frame. Single-channel nodes
/// keep their single `control` frame.
pub fn optimize_batch(
    writes: &[(u32, u8, Action)],
    lookup: &dyn DeviceLookup,
) -> (Vec<QueuedWrite>, BatchReport) {
    let mut order: Vec<u32> = Vec::new();
    let mut per_node: BTreeMap<u32, BTreeMap<u8, Action>> = BTreeMap::new();

    for &(node, channel, action) in writes {
        if !per_node.contains_key(&node) {
            order.push(node);
        }
        per_node.entry(node).or_default().insert(channel, action);
    }

    let mut out = Vec::new();
    let mut original_frames = 0usize;
    let mut missing = 0usize;
    let mut optimized_frames = 0usize;

    for node in order {
        let channels = per_node.remove(&node).unwrap_or_default();
        original_frames += channels.len();

        if !lookup.exists(node) {
            missing += channels.len();
            continue;
        }

        if channels.len() >= 2 {
            let mut actions = [Action::Stop; 4];
            for ch in 0..4u8 {
                actions[ch as usize] = channels
                    .get(&ch)
                    .copied()
                    .unwrap_or_else(|| lookup.last_action(node, ch));
            }
            out.push(QueuedWrite::Multi { node, actions });
        } else if let Some((&channel, &action)) = channels.iter().next() {
            out.push(QueuedWrite::Single { node, channel, action });
        }
        optimized_frames += 1;
    }

    let report = BatchReport {
        total: original_frames,
        accepted: original_frames - missing,
        missing,
        original_frames,
        optimized_frames,
    };
    (out, report)
}
