//! C9 — Core Context: owns every other component and exposes the
//! operations external callers (RPC handlers, cloud handlers, timers)
//! invoke. Grounded on `CoreContext` in the original source — the single
//! object that wires the CAN layer, device registry, job queue and
//! strategy engine together.

use crate::can::codec::{Action, ChannelStatus};
use crate::can::transport::{CanSink, LinkResetter, RawFrame};
use crate::can::CanAdapter;
use crate::clock::Clock;
use crate::devices::relay::RelayDevice;
use crate::devices::DeviceRouter;
use crate::error::{CoreError, CoreResult};
use crate::queue::optimizer::{self, BatchReport, DeviceLookup, QueuedWrite};
use crate::queue::{ControlJobQueue, ControlJobResult, EnqueueResult, ExecOutcome, JobExecutor, QueueSnapshot};
use crate::sensors::SensorTable;
use crate::strategy::{self, DeleteOutcome, FireResult, Strategy, StrategyEngine, TimeOfDay};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A channel's last-known cache entry plus online/age metadata, as exposed
/// to RPC and cloud callers via `relay.status`/`relay.statusAll`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayStatusSnapshot {
    pub node: u32,
    pub channel: u8,
    pub status: ChannelStatus,
    pub online: bool,
    pub age_ms: Option<i64>,
}

/// One entry of `relay.nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSummary {
    pub node: u32,
    pub online: bool,
    pub age_ms: Option<i64>,
}

/// Device kinds representable in the broader system. Only `Relay` has a
/// CAN driver in this implementation (see §4.9 "Device scope").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Relay,
    SensorOnly,
}

/// `group_id -> { name, nodes, channels }`. An empty `channels` set means
/// "all 4 channels of every member node".
#[derive(Debug, Clone, Default)]
pub struct DeviceGroup {
    pub name: String,
    pub nodes: HashSet<u32>,
    pub channels: HashSet<u32>,
}

fn channel_key(node: u32, channel: u8) -> u32 {
    node * 256 + u32::from(channel)
}

pub struct CoreContext<S: CanSink> {
    adapter: CanAdapter<S>,
    router: DeviceRouter,
    devices: HashMap<u32, RelayDevice>,
    groups: HashMap<u32, DeviceGroup>,
    queue: ControlJobQueue,
    sensors: SensorTable,
    strategies: StrategyEngine,
    clock: Arc<dyn Clock>,
}

/// Bridges the device registry and CAN adapter to the job queue's
/// [`JobExecutor`] seam without the queue needing to know either type.
struct DeviceExecutor<'a, S: CanSink> {
    devices: &'a mut HashMap<u32, RelayDevice>,
    adapter: &'a mut CanAdapter<S>,
}

impl<'a, S: CanSink> JobExecutor for DeviceExecutor<'a, S> {
    fn node_registered(&self, node: u32) -> bool {
        self.devices.contains_key(&node)
    }

    fn execute(&mut self, node: u32, channel: u8, action: Action) -> ExecOutcome {
        match self.devices.get_mut(&node) {
            Some(device) => {
                if device.control(self.adapter, channel, action) {
                    ExecOutcome::Ok
                } else {
                    ExecOutcome::DeviceRejected
                }
            }
            None => ExecOutcome::DeviceNotFound,
        }
    }
}

struct DeviceLookupAdapter<'a> {
    devices: &'a HashMap<u32, RelayDevice>,
}

impl<'a> DeviceLookup for DeviceLookupAdapter<'a> {
    fn exists(&self, node: u32) -> bool {
        self.devices.contains_key(&node)
    }

    fn last_action(&self, node: u32, channel: u8) -> Action {
        self.devices
            .get(&node)
            .map(|d| d.last_action(channel))
            .unwrap_or(Action::Stop)
    }
}

impl<S: CanSink> CoreContext<S> {
    pub fn new(ifname: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            adapter: CanAdapter::new(ifname, Arc::clone(&clock)),
            router: DeviceRouter::new(),
            devices: HashMap::new(),
            groups: HashMap::new(),
            queue: ControlJobQueue::new(),
            sensors: SensorTable::new(),
            strategies: StrategyEngine::new(),
            clock,
        }
    }

    pub fn open_bus(&mut self) -> CoreResult<()> {
        self.adapter.open()
    }

    /// Register a device. Only the relay kind has a CAN driver in this
    /// implementation; anything else is rejected rather than silently
    /// accepted with no backing hardware. `node_id` must be in `1..=255`
    /// and not already registered.
    pub fn add_device(&mut self, node_id: u32, kind: DeviceKind) -> CoreResult<()> {
        if kind != DeviceKind::Relay {
            return Err(CoreError::Validation(format!(
                "device kind {kind:?} has no CAN driver in this build"
            )));
        }
        if !(1..=255).contains(&node_id) {
            return Err(CoreError::Validation(format!(
                "node id {node_id} out of range 1..=255"
            )));
        }
        if self.devices.contains_key(&node_id) {
            return Err(CoreError::Validation(format!("device {node_id} already registered")));
        }
        self.devices.insert(node_id, RelayDevice::new(node_id));
        self.router.register(node_id);
        Ok(())
    }

    pub fn remove_device(&mut self, node_id: u32) {
        self.devices.remove(&node_id);
        self.router.unregister(node_id);
        for group in self.groups.values_mut() {
            group.nodes.remove(&node_id);
            group.channels.retain(|&key| key / 256 != node_id);
        }
    }

    /// Create an empty group. `group_id` must be non-zero and unused.
    pub fn create_group(&mut self, group_id: u32, name: impl Into<String>) -> CoreResult<()> {
        if group_id == 0 {
            return Err(CoreError::Validation("group id must be > 0".to_string()));
        }
        if self.groups.contains_key(&group_id) {
            return Err(CoreError::Validation(format!("group {group_id} already exists")));
        }
        self.groups.insert(
            group_id,
            DeviceGroup {
                name: name.into(),
                nodes: HashSet::new(),
                channels: HashSet::new(),
            },
        );
        Ok(())
    }

    pub fn delete_group(&mut self, group_id: u32) -> bool {
        self.groups.remove(&group_id).is_some()
    }

    fn group_mut(&mut self, group_id: u32) -> CoreResult<&mut DeviceGroup> {
        self.groups
            .get_mut(&group_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown group {group_id}")))
    }

    pub fn add_device_to_group(&mut self, group_id: u32, node: u32) -> CoreResult<()> {
        self.group_mut(group_id)?.nodes.insert(node);
        Ok(())
    }

    pub fn remove_device_from_group(&mut self, group_id: u32, node: u32) -> CoreResult<()> {
        let group = self.group_mut(group_id)?;
        group.nodes.remove(&node);
        group.channels.retain(|&key| key / 256 != node);
        Ok(())
    }

    pub fn add_channel_to_group(&mut self, group_id: u32, node: u32, channel: u8) -> CoreResult<()> {
        if channel > 3 {
            return Err(CoreError::Validation(format!("channel {channel} out of range 0..=3")));
        }
        self.group_mut(group_id)?.channels.insert(channel_key(node, channel));
        Ok(())
    }

    pub fn remove_channel_to_group(&mut self, group_id: u32, node: u32, channel: u8) -> CoreResult<()> {
        if channel > 3 {
            return Err(CoreError::Validation(format!("channel {channel} out of range 0..=3")));
        }
        self.group_mut(group_id)?.channels.remove(&channel_key(node, channel));
        Ok(())
    }

    /// Route an inbound CAN frame to the owning device(s) and mirror any
    /// resulting status changes into the sensor table.
    pub fn on_frame(&mut self, frame: &RawFrame) {
        let now = self.clock.now_ms();
        let events = self.router.dispatch(frame, &mut self.devices, now);
        for event in events {
            self.sensors
                .update_from_relay(event.node_id, event.channel, event.status, now);
        }
    }

    /// Run the TX pump once; returns whether an interface reset should be
    /// attempted.
    pub fn tx_pump_tick(&mut self) -> bool {
        self.adapter.tx_pump_tick()
    }

    pub fn drain_inbound(&mut self) -> Vec<RawFrame> {
        self.adapter.drain_readable()
    }

    /// Single `(node, channel, action)` control request. Runs the C5 fast
    /// path when the queue is idle.
    pub fn control(
        &mut self,
        node: u32,
        channel: u8,
        action: Action,
        source: impl Into<String>,
        force_queue: bool,
    ) -> EnqueueResult {
        let now = self.clock.now_ms();
        let mut executor = DeviceExecutor {
            devices: &mut self.devices,
            adapter: &mut self.adapter,
        };
        self.queue
            .enqueue(&mut executor, node, channel, action, source, force_queue, now)
    }

    /// Run one queue-processor tick; also runs tombstone/result GC on the
    /// idle transition (one tick after the queue drains).
    pub fn process_queue_tick(&mut self) {
        let now = self.clock.now_ms();
        let mut executor = DeviceExecutor {
            devices: &mut self.devices,
            adapter: &mut self.adapter,
        };
        let idle = self.queue.process_tick(&mut executor, now);
        if idle {
            self.strategies.gc_tombstones(now);
        }
    }

    /// Apply a full group write, coalescing per-channel writes into
    /// multi-channel frames wherever a node is touched on 2+ channels.
    pub fn control_group(&mut self, group_id: u32, action: Action, _source: impl Into<String>) -> CoreResult<BatchReport> {
        let group = self
            .groups
            .get(&group_id)
            .ok_or_else(|| CoreError::Validation(format!("unknown group {group_id}")))?;

        let mut writes = Vec::new();
        if group.channels.is_empty() {
            for &node in &group.nodes {
                for channel in 0..4u8 {
                    writes.push((node, channel, action));
                }
            }
        } else {
            for &key in &group.channels {
                writes.push((key / 256, (key % 256) as u8, action));
            }
        }

        let lookup = DeviceLookupAdapter { devices: &self.devices };
        let (plan, report) = optimizer::optimize_batch(&writes, &lookup);
        apply_plan(&mut self.devices, &mut self.adapter, &plan);
        Ok(report)
    }

    /// Every action's identifier must parse, its node must be registered,
    /// its channel must be `0..=3` and its value `{0,1,2}` — the whole
    /// strategy is rejected on any single failure.
    fn validate_strategy(&self, strategy: &Strategy) -> CoreResult<()> {
        for action in &strategy.actions {
            let (node, _channel, _act) = strategy::parse_action(action).ok_or_else(|| {
                CoreError::Validation(format!(
                    "action {:?} has an unparseable identifier or out-of-range value",
                    action.identifier
                ))
            })?;
            if !self.devices.contains_key(&node) {
                return Err(CoreError::Validation(format!("action targets unregistered node {node}")));
            }
        }
        Ok(())
    }

    pub fn create_or_update_strategy(&mut self, strategy: Strategy) -> CoreResult<Strategy> {
        self.validate_strategy(&strategy)?;
        Ok(self.strategies.create_or_update(strategy).clone())
    }

    pub fn delete_strategy(&mut self, id: &str) -> DeleteOutcome {
        let now = self.clock.now_ms();
        self.strategies.delete(id, now)
    }

    pub fn set_strategy_id(&mut self, old: &str, new: String) -> Result<(), String> {
        self.strategies.set_id(old, new)
    }

    /// `auto.strategy.list`.
    pub fn list_strategies(&self) -> Vec<Strategy> {
        self.strategies.list().into_iter().cloned().collect()
    }

    /// `auto.strategy.enable`.
    pub fn set_strategy_enabled(&mut self, id: &str, enabled: bool) -> CoreResult<()> {
        if self.strategies.set_enabled(id, enabled) {
            Ok(())
        } else {
            Err(CoreError::Validation(format!("unknown strategy {id}")))
        }
    }

    /// `auto.strategy.trigger` — fire a strategy now, bypassing its
    /// schedule and debounce gates but still honoring `enabled` and its
    /// conditions.
    pub fn trigger_strategy(&mut self, id: &str) -> CoreResult<FireResult> {
        let now_ms = self.clock.now_ms();
        let fired = self
            .strategies
            .force_fire(id, now_ms, &self.sensors)
            .ok_or_else(|| CoreError::Validation(format!("strategy {id} not found, disabled, or conditions unmet")))?;
        let lookup = DeviceLookupAdapter { devices: &self.devices };
        let (plan, _report) = optimizer::optimize_batch(&fired.writes, &lookup);
        apply_plan(&mut self.devices, &mut self.adapter, &plan);
        Ok(fired)
    }

    /// Evaluate all strategies for this tick and apply whatever fires via
    /// the batch optimizer, exactly like an externally-issued group write.
    pub fn evaluate_strategies_tick(&mut self, now: TimeOfDay) -> Vec<FireResult> {
        let now_ms = self.clock.now_ms();
        let fired = self.strategies.evaluate_tick(now_ms, now, &self.sensors);
        for result in &fired {
            let lookup = DeviceLookupAdapter { devices: &self.devices };
            let (plan, _report) = optimizer::optimize_batch(&result.writes, &lookup);
            apply_plan(&mut self.devices, &mut self.adapter, &plan);
        }
        fired
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<&crate::sensors::SensorEntry> {
        self.sensors.get(sensor_id)
    }

    pub fn sensors_mut(&mut self) -> &mut SensorTable {
        &mut self.sensors
    }

    pub fn adapter_stats(&self) -> crate::can::AdapterStats {
        self.adapter.stats()
    }

    pub fn device(&self, node_id: u32) -> Option<&RelayDevice> {
        self.devices.get(&node_id)
    }

    /// `relay.controlMulti` — one CAN frame controlling all four channels.
    pub fn control_multi(&mut self, node: u32, actions: [Action; 4]) -> bool {
        match self.devices.get(&node) {
            Some(device) => device.control_multi(&mut self.adapter, actions),
            None => false,
        }
    }

    /// `relay.query` — true iff the query frame was enqueued.
    pub fn query(&mut self, node: u32, channel: u8) -> bool {
        match self.devices.get(&node) {
            Some(device) => device.query(&mut self.adapter, channel),
            None => false,
        }
    }

    /// `relay.queryAll`.
    pub fn query_all(&mut self, node: u32) -> bool {
        match self.devices.get(&node) {
            Some(device) => device.query_all(&mut self.adapter),
            None => false,
        }
    }

    fn status_snapshot(&self, node: u32, channel: u8) -> Option<RelayStatusSnapshot> {
        let device = self.devices.get(&node)?;
        let now = self.clock.now_ms();
        Some(RelayStatusSnapshot {
            node,
            channel,
            status: device.last_status(channel),
            online: device.online(now),
            age_ms: device.last_seen_ms().map(|seen| now - seen),
        })
    }

    /// `relay.status`.
    pub fn status(&self, node: u32, channel: u8) -> Option<RelayStatusSnapshot> {
        self.status_snapshot(node, channel)
    }

    /// `relay.statusAll`.
    pub fn status_all(&self, node: u32) -> Option<Vec<RelayStatusSnapshot>> {
        if !self.devices.contains_key(&node) {
            return None;
        }
        Some((0..4u8).filter_map(|channel| self.status_snapshot(node, channel)).collect())
    }

    /// `relay.nodes` — sorted by node id.
    pub fn nodes(&self) -> Vec<NodeSummary> {
        let now = self.clock.now_ms();
        let mut summaries: Vec<NodeSummary> = self
            .devices
            .values()
            .map(|d| NodeSummary {
                node: d.node_id(),
                online: d.online(now),
                age_ms: d.last_seen_ms().map(|seen| now - seen),
            })
            .collect();
        summaries.sort_by_key(|s| s.node);
        summaries
    }

    /// `relay.emergencyStop` — stop every channel of every device, one
    /// frame per channel.
    pub fn emergency_stop(&mut self) -> usize {
        let writes: Vec<(u32, u8, Action)> = self
            .devices
            .keys()
            .flat_map(|&node| (0..4u8).map(move |channel| (node, channel, Action::Stop)))
            .collect();
        apply_plan_single(&mut self.devices, &mut self.adapter, &writes)
    }

    /// `relay.emergencyStopOptimized` — stop every device with one
    /// multi-channel frame per device.
    pub fn emergency_stop_optimized(&mut self) -> usize {
        let nodes: Vec<u32> = self.devices.keys().copied().collect();
        let mut successes = 0;
        for node in nodes {
            if self.control_multi(node, [Action::Stop; 4]) {
                successes += 1;
            }
        }
        successes
    }

    /// `control.queue`.
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// `control.job`.
    pub fn job_result(&self, job_id: u64) -> ControlJobResult {
        self.queue.job_result(job_id)
    }

    /// `sensor.update.local` — the local-collaborator write path.
    pub fn update_sensor_local(&mut self, node: u32, channel: u8, value: f64) {
        let now = self.clock.now_ms();
        self.sensors.update_local(node, channel, value, now);
    }

    /// `sensor.update.mqtt` — the cloud-collaborator write path.
    pub fn update_sensor_mqtt(&mut self, channel_id: &str, payload: &serde_json::Value) {
        let now = self.clock.now_ms();
        self.sensors.update_from_mqtt(channel_id, payload, now);
    }

    /// Attempt the last-resort interface reset when the TX pump signals
    /// persistent failure. A no-op under cooldown or attempt-cap, same as
    /// the underlying adapter call.
    pub async fn maybe_reset_interface(&mut self, resetter: &dyn LinkResetter) -> CoreResult<()> {
        self.adapter.try_reset_interface(resetter).await
    }
}

/// Apply single-channel writes directly, without optimizer coalescing —
/// used by the unoptimized emergency-stop path where one frame per
/// channel is the point.
fn apply_plan_single<S: CanSink>(
    devices: &mut HashMap<u32, RelayDevice>,
    adapter: &mut CanAdapter<S>,
    writes: &[(u32, u8, Action)],
) -> usize {
    let mut successes = 0;
    for &(node, channel, action) in writes {
        if devices.get_mut(&node).is_some_and(|d| d.control(adapter, channel, action)) {
            successes += 1;
        }
    }
    successes
}

fn apply_plan<S: CanSink>(
    devices: &mut HashMap<u32, RelayDevice>,
    adapter: &mut CanAdapter<S>,
    plan: &[QueuedWrite],
) -> usize {
    let mut successes = 0;
    for item in plan {
        let ok = match *item {
            QueuedWrite::Single { node, channel, action } => devices
                .get_mut(&node)
                .is_some_and(|d| d.control(adapter, channel, action)),
            QueuedWrite::Multi { node, actions } => devices
                .get_mut(&node)
                .is_some_and(|d| d.control_multi(adapter, actions)),
        };
        if ok {
            successes += 1;
        }
    }
    successes
}
