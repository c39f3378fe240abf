//! UVC wire-level types: the 48-byte probe/commit streaming control, the
//! USB setup packet, and the event/response shapes exchanged with the
//! gadget driver.

use crate::sys;
use tracing::warn;

/// Wire size of the probe/commit structure (UVC 1.5 section 4.3.1).
pub const STREAMING_CONTROL_LEN: usize = 48;

pub const USB_TYPE_MASK: u8 = 0x60;
pub const USB_TYPE_STANDARD: u8 = 0x00;
pub const USB_TYPE_CLASS: u8 = 0x20;

pub const USB_RECIP_MASK: u8 = 0x1f;
pub const USB_RECIP_INTERFACE: u8 = 0x01;

pub const UVC_SET_CUR: u8 = 0x01;
pub const UVC_GET_CUR: u8 = 0x81;
pub const UVC_GET_MIN: u8 = 0x82;
pub const UVC_GET_MAX: u8 = 0x83;
pub const UVC_GET_RES: u8 = 0x84;
pub const UVC_GET_LEN: u8 = 0x85;
pub const UVC_GET_INFO: u8 = 0x86;
pub const UVC_GET_DEF: u8 = 0x87;

pub const UVC_VS_CONTROL_UNDEFINED: u8 = 0x00;
pub const UVC_VS_PROBE_CONTROL: u8 = 0x01;
pub const UVC_VS_COMMIT_CONTROL: u8 = 0x02;

/// Interface numbers as wired up by the kernel UVC gadget function.
pub const CONTROL_INTERFACE: u8 = 0;
pub const STREAMING_INTERFACE: u8 = 1;

/// The UVC video streaming probe/commit structure.
///
/// Carried little-endian on the wire. The UVC 1.5 tail fields past
/// `max_version` are always zero here; they exist so the full 48 bytes
/// round-trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingControl {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_ref_frames: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
}

impl StreamingControl {
    pub fn to_bytes(&self) -> [u8; STREAMING_CONTROL_LEN] {
        let mut out = [0u8; STREAMING_CONTROL_LEN];
        out[0..2].copy_from_slice(&self.hint.to_le_bytes());
        out[2] = self.format_index;
        out[3] = self.frame_index;
        out[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        out[26..30].copy_from_slice(&self.clock_frequency.to_le_bytes());
        out[30] = self.framing_info;
        out[31] = self.preferred_version;
        out[32] = self.min_version;
        out[33] = self.max_version;
        out[34] = self.usage;
        out[35] = self.bit_depth_luma;
        out[36] = self.settings;
        out[37] = self.max_ref_frames;
        out[38..40].copy_from_slice(&self.rate_control_modes.to_le_bytes());
        out[40..48].copy_from_slice(&self.layout_per_stream.to_le_bytes());
        out
    }

    /// Parse a host-supplied payload.
    ///
    /// Hosts speaking older UVC minor versions send 26- or 34-byte
    /// structures; missing trailing fields read as zero. Anything shorter
    /// than the fields needed for negotiation is rejected.
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            warn!("streaming control payload of {} bytes is too short", payload.len());
            return None;
        }
        let mut raw = [0u8; STREAMING_CONTROL_LEN];
        let take = payload.len().min(STREAMING_CONTROL_LEN);
        raw[..take].copy_from_slice(&payload[..take]);
        Some(Self {
            hint: u16::from_le_bytes([raw[0], raw[1]]),
            format_index: raw[2],
            frame_index: raw[3],
            frame_interval: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            key_frame_rate: u16::from_le_bytes([raw[8], raw[9]]),
            p_frame_rate: u16::from_le_bytes([raw[10], raw[11]]),
            comp_quality: u16::from_le_bytes([raw[12], raw[13]]),
            comp_window_size: u16::from_le_bytes([raw[14], raw[15]]),
            delay: u16::from_le_bytes([raw[16], raw[17]]),
            max_video_frame_size: u32::from_le_bytes([raw[18], raw[19], raw[20], raw[21]]),
            max_payload_transfer_size: u32::from_le_bytes([raw[22], raw[23], raw[24], raw[25]]),
            clock_frequency: u32::from_le_bytes([raw[26], raw[27], raw[28], raw[29]]),
            framing_info: raw[30],
            preferred_version: raw[31],
            min_version: raw[32],
            max_version: raw[33],
            usage: raw[34],
            bit_depth_luma: raw[35],
            settings: raw[36],
            max_ref_frames: raw[37],
            rate_control_modes: u16::from_le_bytes([raw[38], raw[39]]),
            layout_per_stream: u64::from_le_bytes([
                raw[40], raw[41], raw[42], raw[43], raw[44], raw[45], raw[46], raw[47],
            ]),
        })
    }
}

/// Decoded USB setup packet from a UVC SETUP event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupRequest {
    pub fn from_bytes(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Control selector, encoded in the high byte of wValue.
    pub fn selector(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Target interface, encoded in the low byte of wIndex.
    pub fn interface(&self) -> u8 {
        (self.index & 0xff) as u8
    }
}

/// A UVC event dequeued from the gadget driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UvcEvent {
    Connect,
    Disconnect,
    StreamOn,
    StreamOff,
    Setup(SetupRequest),
    /// Class-request payload following a SET_CUR.
    Data(Vec<u8>),
    Unknown(u32),
}

/// Reply sent back through `UVCIOC_SEND_RESPONSE`.
#[derive(Debug, Clone, Copy)]
pub struct UvcResponse {
    pub length: i32,
    pub data: [u8; 60],
}

impl Default for UvcResponse {
    fn default() -> Self {
        Self {
            length: 0,
            data: [0; 60],
        }
    }
}

impl UvcResponse {
    /// Copy a streaming control into the reply body with the full wire
    /// length.
    pub fn set_control(&mut self, control: &StreamingControl) {
        let bytes = control.to_bytes();
        self.data[..STREAMING_CONTROL_LEN].copy_from_slice(&bytes);
        self.length = STREAMING_CONTROL_LEN as i32;
    }

    pub(crate) fn to_sys(self) -> sys::uvc_request_data {
        sys::uvc_request_data {
            length: self.length,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_control_round_trips_48_bytes() {
        let control = StreamingControl {
            hint: 1,
            format_index: 2,
            frame_index: 3,
            frame_interval: 333_333,
            max_video_frame_size: 1280 * 720 * 2,
            max_payload_transfer_size: 3072,
            framing_info: 3,
            preferred_version: 1,
            max_version: 1,
            ..Default::default()
        };
        let bytes = control.to_bytes();
        assert_eq!(bytes.len(), STREAMING_CONTROL_LEN);
        assert_eq!(StreamingControl::from_bytes(&bytes), Some(control));
    }

    #[test]
    fn short_host_payload_parses_with_zero_tail() {
        // A UVC 1.0 host sends 26 bytes.
        let control = StreamingControl {
            format_index: 1,
            frame_index: 1,
            frame_interval: 666_666,
            ..Default::default()
        };
        let bytes = control.to_bytes();
        let parsed = StreamingControl::from_bytes(&bytes[..26]).unwrap();
        assert_eq!(parsed.format_index, 1);
        assert_eq!(parsed.frame_interval, 666_666);
        assert_eq!(parsed.layout_per_stream, 0);
    }

    #[test]
    fn runt_payload_is_rejected() {
        assert!(StreamingControl::from_bytes(&[0u8; 7]).is_none());
    }

    #[test]
    fn setup_request_decodes_little_endian_fields() {
        let raw = [0x21, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x00];
        let setup = SetupRequest::from_bytes(&raw);
        assert_eq!(setup.request, UVC_SET_CUR);
        assert_eq!(setup.selector(), UVC_VS_COMMIT_CONTROL);
        assert_eq!(setup.interface(), STREAMING_INTERFACE);
        assert_eq!(setup.length, 48);
    }
}
