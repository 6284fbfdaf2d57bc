//! C4 — Relay Device: per-node 4-channel state cache, control/query API,
//! online tracking. Grounded on `RelayGd427::onStatusFrame` / `canAccept`.

use crate::can::codec::{
    self, Action, AutoStatusReport, ChannelStatus, CmdType, CtrlCmd,
};
use crate::can::{CTRL_BASE_ID, ONLINE_TIMEOUT_MS, STATUS_BASE_ID};
use uuid::Uuid;

/// Marker written to byte 2 (reserved in a single-channel status frame) of
/// an auto-status report so `on_frame` can tell the two 8-byte shapes
/// apart without a second CAN id. Firmware-undocumented; this
/// implementation's own choice (see DESIGN.md).
const AUTO_STATUS_MARKER: u8 = 0xFF;

/// Something a [`RelayDevice`] can send frames through. Devices hold no
/// back-reference to the bus owner — they're handed a sink at the call
/// site instead, breaking the `RelayGd427 -> CoreContext` cycle from the
/// original source.
pub trait FrameSink {
    fn send(&mut self, can_id: u32, payload: &[u8]) -> bool;
}

impl<S: crate::can::transport::CanSink> FrameSink for crate::can::CanAdapter<S> {
    fn send(&mut self, can_id: u32, payload: &[u8]) -> bool {
        self.send_frame(can_id, payload, false, false)
    }
}

/// Event emitted when a channel's cached status changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusUpdated {
    pub node_id: u32,
    pub channel: u8,
    pub status: ChannelStatus,
}

/// Per-node state for a 4-channel GD427 relay.
pub struct RelayDevice {
    uuid: Uuid,
    node_id: u32,
    status: [ChannelStatus; 4],
    last_auto_status: AutoStatusReport,
    last_seen_ms: Option<i64>,
}

impl RelayDevice {
    pub fn new(node_id: u32) -> Self {
        let mut status = [ChannelStatus::default(); 4];
        for (ch, s) in status.iter_mut().enumerate() {
            s.channel = ch as u8;
        }
        Self {
            uuid: Uuid::new_v4(),
            node_id,
            status,
            last_auto_status: AutoStatusReport::default(),
            last_seen_ms: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn ctrl_can_id(&self) -> u32 {
        CTRL_BASE_ID + self.node_id
    }

    pub fn status_can_id(&self) -> u32 {
        STATUS_BASE_ID + self.node_id
    }

    /// Query every channel's status on init.
    pub fn init(&self, sink: &mut dyn FrameSink) -> bool {
        let mut ok = true;
        for channel in 0..=3u8 {
            ok &= self.query(sink, channel);
        }
        ok
    }

    pub fn control(&mut self, sink: &mut dyn FrameSink, channel: u8, action: Action) -> bool {
        if channel > 3 {
            return false;
        }
        let frame = codec::encode_ctrl(CtrlCmd {
            cmd_type: CmdType::ControlRelay,
            channel,
            action,
        });
        sink.send(self.ctrl_can_id(), &frame)
    }

    pub fn query(&self, sink: &mut dyn FrameSink, channel: u8) -> bool {
        if channel > 3 {
            return false;
        }
        let frame = codec::encode_ctrl(CtrlCmd {
            cmd_type: CmdType::QueryStatus,
            channel,
            action: Action::Stop,
        });
        sink.send(self.ctrl_can_id(), &frame)
    }

    pub fn query_all(&self, sink: &mut dyn FrameSink) -> bool {
        sink.send(self.ctrl_can_id(), &codec::encode_query_all())
    }

    /// Emit one frame controlling all four channels. Per the optimizer
    /// invariant, slots the caller doesn't care about must already carry
    /// this device's last-observed mode — `actions` is expected to be
    /// pre-filled by the caller (see the group/batch optimizer).
    pub fn control_multi(&self, sink: &mut dyn FrameSink, actions: [Action; 4]) -> bool {
        sink.send(self.ctrl_can_id(), &codec::encode_ctrl_multi(actions))
    }

    pub fn set_overcurrent_flag(
        &self,
        sink: &mut dyn FrameSink,
        channel_or_all: u8,
        flag: bool,
    ) -> bool {
        sink.send(
            self.ctrl_can_id(),
            &codec::encode_set_overcurrent_flag(channel_or_all, flag),
        )
    }

    /// The action this device would keep outputting on `channel` if left
    /// untouched — defaults to `Stop` when nothing has ever been observed.
    pub fn last_action(&self, channel: u8) -> Action {
        self.last_status(channel).action()
    }

    pub fn last_status(&self, channel: u8) -> ChannelStatus {
        self.status
            .get(channel as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn last_auto_status(&self) -> AutoStatusReport {
        self.last_auto_status
    }

    pub fn last_seen_ms(&self) -> Option<i64> {
        self.last_seen_ms
    }

    pub fn online(&self, now_ms: i64) -> bool {
        self.last_seen_ms
            .is_some_and(|seen| now_ms - seen <= ONLINE_TIMEOUT_MS)
    }

    pub fn accepts(&self, can_id: u32, extended: bool, rtr: bool) -> bool {
        !extended && !rtr && can_id == self.status_can_id()
    }

    /// Update `last_seen_ms` for any well-formed frame, independent of
    /// whether it can be decoded — online tracking must not depend on
    /// decode success.
    pub fn on_frame(&mut self, payload: &[u8], now_ms: i64) -> Vec<StatusUpdated> {
        self.last_seen_ms = Some(now_ms);

        let Ok(payload): Result<[u8; 8], _> = payload.try_into() else {
            return Vec::new();
        };

        if payload[2] == AUTO_STATUS_MARKER {
            let report = codec::decode_auto_status(&payload);
            self.last_auto_status = report;
            let mut events = Vec::with_capacity(4);
            for (channel, per) in report.channels.iter().enumerate() {
                let status_byte = per.mode | (u8::from(per.phase_lost) << 2);
                let status = ChannelStatus {
                    channel: channel as u8,
                    status_byte,
                    current_a: per.current_a,
                };
                self.status[channel] = status;
                events.push(StatusUpdated {
                    node_id: self.node_id,
                    channel: channel as u8,
                    status,
                });
            }
            events
        } else {
            match codec::decode_status(&payload) {
                Some(status) if (status.channel as usize) < self.status.len() => {
                    self.status[status.channel as usize] = status;
                    vec![StatusUpdated {
                        node_id: self.node_id,
                        channel: status.channel,
                        status,
                    }]
                }
                _ => Vec::new(),
            }
        }
    }
}
