//! Relay wire protocol: pure encode/decode functions, no I/O.
//!
//! Grounded on the firmware's control/status frame layout: control frames are
//! `[type, channel, action, 0, 0, 0, 0, 0]`, status frames carry the channel,
//! a packed status byte, and a little-endian f32 current in bytes 4..=7.
//! The multi-channel control, query-all and overcurrent-flag frame shapes
//! have no upstream wire capture to confirm against; the layouts below are
//! this implementation's own choice, recorded in DESIGN.md.

use static_assertions::const_assert_eq;

/// Base CAN id for control frames; the device's node id is added to it.
pub const CTRL_BASE_ID: u32 = 0x100;
/// Base CAN id for status frames; the device's node id is added to it.
pub const STATUS_BASE_ID: u32 = 0x200;

/// Control/query frame type tag (byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdType {
    ControlRelay = 0x01,
    QueryStatus = 0x02,
    ControlRelayMulti = 0x03,
    QueryStatusAll = 0x04,
    SetOvercurrentFlag = 0x05,
}

/// Per-channel output action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Stop = 0,
    Forward = 1,
    Reverse = 2,
}

impl Action {
    /// Map the 2-bit mode field of a status byte back to an action.
    /// The reserved value `3` decodes as `Stop`, matching the firmware's
    /// treatment of mode bits as a saturating 2-bit field.
    pub fn from_mode_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => Action::Forward,
            2 => Action::Reverse,
            _ => Action::Stop,
        }
    }
}

/// A single-channel control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlCmd {
    pub cmd_type: CmdType,
    pub channel: u8,
    pub action: Action,
}

/// Decoded status of one relay channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStatus {
    pub channel: u8,
    pub status_byte: u8,
    pub current_a: f32,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            channel: 0,
            status_byte: 0,
            current_a: 0.0,
        }
    }
}

impl ChannelStatus {
    pub fn mode_bits(&self) -> u8 {
        mode_bits(self.status_byte)
    }

    pub fn phase_lost(&self) -> bool {
        phase_lost(self.status_byte)
    }

    pub fn action(&self) -> Action {
        Action::from_mode_bits(self.mode_bits())
    }
}

/// One channel's slice of a whole-device auto-status report.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerChannel {
    pub mode: u8,
    pub phase_lost: bool,
    pub overcurrent: bool,
    pub current_a: f32,
}

/// Whole-device auto-status report, one entry per channel 0..=3.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AutoStatusReport {
    pub channels: [PerChannel; 4],
}

/// `status_byte & 0x03` — the packed mode field.
pub fn mode_bits(status_byte: u8) -> u8 {
    status_byte & 0x03
}

/// `status_byte & 0x04 != 0` — the packed phase-lost flag.
pub fn phase_lost(status_byte: u8) -> bool {
    status_byte & 0x04 != 0
}

/// Little-endian IEEE-754 f32, bit-exact memcpy.
pub fn le_f32(bytes: &[u8; 4]) -> f32 {
    f32::from_le_bytes(*bytes)
}

/// Inverse of [`le_f32`].
pub fn put_le_f32(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}

const_assert_eq!(std::mem::size_of::<[u8; 8]>(), 8);

/// Encode a single-channel control/query command per §3's 8-byte layout.
pub fn encode_ctrl(cmd: CtrlCmd) -> [u8; 8] {
    [
        cmd.cmd_type as u8,
        cmd.channel,
        cmd.action as u8,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Encode a multi-channel control frame: one action per channel, in order.
pub fn encode_ctrl_multi(actions: [Action; 4]) -> [u8; 8] {
    [
        CmdType::ControlRelayMulti as u8,
        actions[0] as u8,
        actions[1] as u8,
        actions[2] as u8,
        actions[3] as u8,
        0,
        0,
        0,
    ]
}

/// Encode a query-all-channels frame.
pub fn encode_query_all() -> [u8; 8] {
    [CmdType::QueryStatusAll as u8, 0, 0, 0, 0, 0, 0, 0]
}

/// Encode a set-overcurrent-flag command. `channel_or_all == 0xFF` targets
/// all four channels.
pub fn encode_set_overcurrent_flag(channel_or_all: u8, flag: bool) -> [u8; 8] {
    [
        CmdType::SetOvercurrentFlag as u8,
        channel_or_all,
        flag as u8,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Decode a single-channel status frame. Always `Some` for an 8-byte input;
/// kept `Option`-returning to mirror the firmware contract that a
/// differently-sized buffer never reaches this function.
pub fn decode_status(payload: &[u8; 8]) -> Option<ChannelStatus> {
    let current = le_f32(&[payload[4], payload[5], payload[6], payload[7]]);
    Some(ChannelStatus {
        channel: payload[0],
        status_byte: payload[1],
        current_a: current,
    })
}

/// Decode a whole-device auto-status report.
///
/// Bytes 0-1 hold 4 packed `(mode:2, phase_lost:1, overcurrent:1)` nibbles,
/// low nibble of byte 0 is channel 0 through high nibble of byte 1 for
/// channel 3. Bytes 2..=7 hold 4 little-endian 12-bit tenths-of-amp values,
/// packed two-per-three-bytes (channels 0-1 in bytes 2-4, channels 2-3 in
/// bytes 5-7), current channel low nibble first.
pub fn decode_auto_status(payload: &[u8; 8]) -> AutoStatusReport {
    let nibble = |byte: u8, high: bool| -> u8 {
        if high {
            (byte >> 4) & 0x0f
        } else {
            byte & 0x0f
        }
    };

    let mut channels = [PerChannel::default(); 4];
    let packed = [
        nibble(payload[0], false),
        nibble(payload[0], true),
        nibble(payload[1], false),
        nibble(payload[1], true),
    ];
    for (idx, bits) in packed.iter().enumerate() {
        channels[idx].mode = bits & 0x03;
        channels[idx].phase_lost = bits & 0x04 != 0;
        channels[idx].overcurrent = bits & 0x08 != 0;
    }

    let currents = [
        unpack_u12(payload[2], payload[3], false),
        unpack_u12(payload[3], payload[4], true),
        unpack_u12(payload[5], payload[6], false),
        unpack_u12(payload[6], payload[7], true),
    ];
    for (idx, raw) in currents.iter().enumerate() {
        channels[idx].current_a = *raw as f32 / 10.0;
    }

    AutoStatusReport { channels }
}

/// Unpack one 12-bit value from a pair of adjacent bytes. `high` selects
/// whether the value starts at the low or high nibble of `lo`.
fn unpack_u12(lo: u8, hi: u8, high: bool) -> u16 {
    if !high {
        u16::from(lo) | (u16::from(hi & 0x0f) << 8)
    } else {
        (u16::from(lo) >> 4) | (u16::from(hi) << 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CmdType::ControlRelay, 0, Action::Forward)]
    #[case(CmdType::ControlRelay, 3, Action::Reverse)]
    #[case(CmdType::QueryStatus, 2, Action::Stop)]
    fn encode_ctrl_round_trips_first_three_bytes(
        #[case] cmd_type: CmdType,
        #[case] channel: u8,
        #[case] action: Action,
    ) {
        let encoded = encode_ctrl(CtrlCmd {
            cmd_type,
            channel,
            action,
        });
        assert_eq!(encoded[0], cmd_type as u8);
        assert_eq!(encoded[1], channel);
        assert_eq!(encoded[2], action as u8);
        assert_eq!(&encoded[3..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn decode_status_matches_le_f32_bit_for_bit() {
        let current_bytes = put_le_f32(3.25);
        let mut payload = [0u8; 8];
        payload[0] = 2;
        payload[1] = 0b0000_0101; // mode=Forward, phase_lost set
        payload[4..8].copy_from_slice(&current_bytes);

        let status = decode_status(&payload).expect("status always decodes");
        assert_eq!(status.channel, 2);
        assert_eq!(status.status_byte, payload[1]);
        assert_eq!(status.current_a.to_bits(), current_bytes_to_f32(&current_bytes).to_bits());
    }

    fn current_bytes_to_f32(bytes: &[u8; 4]) -> f32 {
        f32::from_le_bytes(*bytes)
    }

    #[test]
    fn mode_bits_and_phase_lost_read_expected_positions() {
        let status_byte = 0b0000_0110; // mode=2 (Reverse), phase_lost bit unset
        assert_eq!(mode_bits(status_byte), 2);
        assert!(!phase_lost(status_byte));

        let status_byte = 0b0000_0101; // mode=1 (Forward), phase_lost set
        assert_eq!(mode_bits(status_byte), 1);
        assert!(phase_lost(status_byte));
    }

    #[test]
    fn action_from_mode_bits_maps_reserved_value_to_stop() {
        assert_eq!(Action::from_mode_bits(0), Action::Stop);
        assert_eq!(Action::from_mode_bits(1), Action::Forward);
        assert_eq!(Action::from_mode_bits(2), Action::Reverse);
        assert_eq!(Action::from_mode_bits(3), Action::Stop);
    }

    #[test]
    fn encode_ctrl_multi_places_one_action_byte_per_channel() {
        let encoded = encode_ctrl_multi([Action::Stop, Action::Forward, Action::Reverse, Action::Stop]);
        assert_eq!(encoded[0], CmdType::ControlRelayMulti as u8);
        assert_eq!(&encoded[1..5], &[0, 1, 2, 0]);
        assert_eq!(&encoded[5..], &[0, 0, 0]);
    }

    #[test]
    fn decode_auto_status_recovers_mode_and_phase_lost_per_channel() {
        // channel 0: mode=1, phase_lost=1, overcurrent=0 -> nibble 0b0101 = 5
        // channel 1: mode=2, phase_lost=0, overcurrent=1 -> nibble 0b1010 = 10
        let payload = [0x5A, 0x00, 0, 0, 0, 0, 0, 0];
        let report = decode_auto_status(&payload);
        assert_eq!(report.channels[0].mode, 1);
        assert!(report.channels[0].phase_lost);
        assert!(!report.channels[0].overcurrent);
        assert_eq!(report.channels[1].mode, 2);
        assert!(!report.channels[1].phase_lost);
        assert!(report.channels[1].overcurrent);
    }
}
