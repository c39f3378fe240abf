//! The UVC PROBE/COMMIT control state machine.
//!
//! Pure with respect to the device: setup/data events come in, replies and
//! commit actions come out, and the caller applies them via V4L2. That
//! keeps negotiation testable without a gadget node.

use crate::protocol::{
    CONTROL_INTERFACE, STREAMING_CONTROL_LEN, STREAMING_INTERFACE, SetupRequest, StreamingControl,
    USB_RECIP_INTERFACE, USB_RECIP_MASK, USB_TYPE_CLASS, USB_TYPE_MASK, USB_TYPE_STANDARD,
    UVC_GET_CUR, UVC_GET_DEF, UVC_GET_INFO, UVC_GET_LEN, UVC_GET_MAX, UVC_GET_MIN, UVC_GET_RES,
    UVC_SET_CUR, UVC_VS_COMMIT_CONTROL, UVC_VS_PROBE_CONTROL, UvcResponse,
};
use gadgetcam_core::prelude::*;
use tracing::{debug, error, warn};

/// USB bulk payload size advertised in every negotiation reply.
const PAYLOAD_TRANSFER_SIZE: u32 = 3072;

/// Which control the host last addressed with SET_CUR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Selector {
    #[default]
    Undefined,
    Probe,
    Commit,
}

/// Stream parameters to apply to the gadget node after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitAction {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub fps: u32,
    pub size_image: u32,
}

/// Negotiate a host-requested triplet against the advertised catalogue.
///
/// Format and frame indices clamp to the catalogue bounds; a zero index
/// aborts (the stored control is left untouched). The interval resolves to
/// the first advertised interval at or above the request, or the largest
/// one when the request exceeds them all.
pub fn negotiate(catalogue: &FormatCatalogue, triplet: &FormatTriplet) -> Option<StreamingControl> {
    let format_count = catalogue.len().min(u8::MAX as usize) as u8;
    let format_index = triplet.format_index.min(format_count);
    let format = catalogue.format(format_index)?;

    let frame_count = format.frames.len().min(u8::MAX as usize) as u8;
    let frame_index = triplet.frame_index.min(frame_count);
    let frame = catalogue.frame(format_index, frame_index)?;

    let interval = frame
        .intervals
        .iter()
        .copied()
        .find(|advertised| triplet.interval <= *advertised)
        .or_else(|| frame.max_interval())?;

    let mut control = StreamingControl {
        hint: 1,
        framing_info: 3,
        preferred_version: 1,
        max_version: 1,
        format_index,
        frame_index,
        frame_interval: interval,
        max_payload_transfer_size: PAYLOAD_TRANSFER_SIZE,
        ..Default::default()
    };
    if format.fourcc == FOURCC_YUYV || format.fourcc == FOURCC_MJPEG {
        // Exact for YUY2; worst-case bound for MJPEG.
        control.max_video_frame_size = frame.width * frame.height * 2;
    } else {
        error!("fourcc {} is neither YUY2 nor MJPEG", format.fourcc);
    }
    Some(control)
}

/// Control-plane state for one gadget session.
pub struct ControlMachine {
    catalogue: FormatCatalogue,
    selector: Selector,
    probe: StreamingControl,
    commit: StreamingControl,
}

impl ControlMachine {
    /// Build the machine with the commit control preloaded from the
    /// default triplet (format 1, frame 1, smallest interval).
    pub fn new(catalogue: FormatCatalogue) -> Self {
        let commit =
            negotiate(&catalogue, &FormatTriplet::new(1, 1, 0)).unwrap_or_default();
        Self {
            catalogue,
            selector: Selector::Undefined,
            probe: StreamingControl::default(),
            commit,
        }
    }

    pub fn catalogue(&self) -> &FormatCatalogue {
        &self.catalogue
    }

    pub fn commit(&self) -> &StreamingControl {
        &self.commit
    }

    pub fn probe(&self) -> &StreamingControl {
        &self.probe
    }

    /// Zero the negotiation state; used on STREAMOFF.
    pub fn reset(&mut self) {
        self.selector = Selector::Undefined;
        self.probe = StreamingControl::default();
        self.commit = StreamingControl::default();
    }

    /// Dispatch a SETUP event and produce the reply to send back.
    pub fn handle_setup(&mut self, setup: &SetupRequest) -> UvcResponse {
        let mut response = UvcResponse::default();
        match setup.request_type & USB_TYPE_MASK {
            USB_TYPE_STANDARD => warn!("standard usb request not handled"),
            USB_TYPE_CLASS => self.handle_class(setup, &mut response),
            other => error!("unknown request type {other:#04x}"),
        }
        response
    }

    fn handle_class(&mut self, setup: &SetupRequest, response: &mut UvcResponse) {
        if setup.request_type & USB_RECIP_MASK != USB_RECIP_INTERFACE {
            error!("invalid bRequestType {:#04x}", setup.request_type);
            return;
        }
        match setup.interface() {
            CONTROL_INTERFACE => {
                // Unit controls are stubbed: report GET/SET support only.
                response.data[0] = 0x3;
                response.length = setup.length as i32;
            }
            STREAMING_INTERFACE => self.handle_streaming(setup, response),
            other => debug!("class request for unhandled interface {other}"),
        }
    }

    fn handle_streaming(&mut self, setup: &SetupRequest, response: &mut UvcResponse) {
        let selector = setup.selector();
        if selector != UVC_VS_PROBE_CONTROL && selector != UVC_VS_COMMIT_CONTROL {
            error!("control selector {selector} is invalid");
            return;
        }
        response.length = STREAMING_CONTROL_LEN as i32;

        let max_triplet = FormatTriplet::new(u8::MAX, u8::MAX, u32::MAX);
        let default_triplet = FormatTriplet::new(1, 1, 0);

        match setup.request {
            UVC_SET_CUR => {
                self.selector = if selector == UVC_VS_PROBE_CONTROL {
                    Selector::Probe
                } else {
                    Selector::Commit
                };
            }
            UVC_GET_CUR => {
                let current = if selector == UVC_VS_PROBE_CONTROL {
                    &self.probe
                } else {
                    &self.commit
                };
                response.set_control(current);
            }
            UVC_GET_MAX => {
                if let Some(control) = negotiate(&self.catalogue, &max_triplet) {
                    response.set_control(&control);
                }
            }
            UVC_GET_MIN | UVC_GET_DEF => {
                if let Some(control) = negotiate(&self.catalogue, &default_triplet) {
                    response.set_control(&control);
                }
            }
            UVC_GET_RES => {
                response.data[..STREAMING_CONTROL_LEN].fill(0);
            }
            UVC_GET_LEN => {
                // Little-endian length of the streaming control (0x0030).
                response.data[0] = 0x30;
                response.data[1] = 0x00;
                response.length = 2;
            }
            UVC_GET_INFO => {
                // UVC 1.5 section 4.1.2: supports GET and SET.
                response.data[0] = 0x3;
                response.length = 1;
            }
            other => error!("streaming request {other:#04x} not supported"),
        }
    }

    /// Handle the DATA event that follows a SET_CUR. A commit returns the
    /// stream parameters the caller must apply via V4L2.
    pub fn handle_data(&mut self, payload: &[u8]) -> Option<CommitAction> {
        let request = StreamingControl::from_bytes(payload)?;
        let triplet = FormatTriplet::new(
            request.format_index,
            request.frame_index,
            request.frame_interval,
        );
        match self.selector {
            Selector::Probe => {
                if let Some(control) = negotiate(&self.catalogue, &triplet) {
                    self.probe = control;
                }
                None
            }
            Selector::Commit => {
                let control = negotiate(&self.catalogue, &triplet)?;
                self.commit = control;
                self.commit_action()
            }
            Selector::Undefined => {
                error!("data event while control selector is undefined");
                None
            }
        }
    }

    fn commit_action(&self) -> Option<CommitAction> {
        let format = self.catalogue.format(self.commit.format_index)?;
        let frame = self
            .catalogue
            .frame(self.commit.format_index, self.commit.frame_index)?;
        if self.commit.frame_interval == 0 {
            error!("commit carries a zero frame interval");
            return None;
        }
        Some(CommitAction {
            width: frame.width,
            height: frame.height,
            fourcc: format.fourcc,
            fps: FRAME_INTERVAL_UNITS / self.commit.frame_interval,
            size_image: self.commit.max_video_frame_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn catalogue() -> FormatCatalogue {
        FormatCatalogue::new(vec![
            FormatDesc {
                index: 1,
                fourcc: FOURCC_MJPEG,
                frames: vec![
                    FrameDesc {
                        index: 1,
                        width: 1280,
                        height: 720,
                        intervals: smallvec![333_333, 666_666],
                    },
                    FrameDesc {
                        index: 2,
                        width: 640,
                        height: 480,
                        intervals: smallvec![166_666, 333_333, 1_000_000],
                    },
                ],
            },
            FormatDesc {
                index: 2,
                fourcc: FOURCC_YUYV,
                frames: vec![FrameDesc {
                    index: 1,
                    width: 640,
                    height: 360,
                    intervals: smallvec![333_333],
                }],
            },
        ])
    }

    fn streaming_setup(request: u8, selector: u8) -> SetupRequest {
        SetupRequest {
            request_type: USB_TYPE_CLASS | USB_RECIP_INTERFACE,
            request,
            value: (selector as u16) << 8,
            index: STREAMING_INTERFACE as u16,
            length: 48,
        }
    }

    #[test]
    fn negotiate_picks_the_exact_interval() {
        let control = negotiate(&catalogue(), &FormatTriplet::new(1, 2, 333_333)).unwrap();
        assert_eq!(control.frame_interval, 333_333);
        assert_eq!(control.max_payload_transfer_size, 3072);
        assert_eq!(control.max_video_frame_size, 640 * 480 * 2);
        assert_eq!(control.hint, 1);
        assert_eq!(control.framing_info, 3);
    }

    #[test]
    fn negotiate_rounds_up_to_the_next_interval() {
        let control = negotiate(&catalogue(), &FormatTriplet::new(1, 2, 200_000)).unwrap();
        assert_eq!(control.frame_interval, 333_333);
    }

    #[test]
    fn negotiate_clamps_out_of_range_requests() {
        let control =
            negotiate(&catalogue(), &FormatTriplet::new(0xff, 0xff, u32::MAX)).unwrap();
        assert_eq!(control.format_index, 2);
        assert_eq!(control.frame_index, 1);
        assert_eq!(control.frame_interval, 333_333);
    }

    #[test]
    fn negotiate_aborts_on_zero_indices() {
        assert!(negotiate(&catalogue(), &FormatTriplet::new(0, 1, 0)).is_none());
        assert!(negotiate(&catalogue(), &FormatTriplet::new(1, 0, 0)).is_none());
    }

    #[test]
    fn negotiate_is_idempotent() {
        let cat = catalogue();
        let triplet = FormatTriplet::new(1, 1, 400_000);
        let first = negotiate(&cat, &triplet).unwrap();
        let second = negotiate(&cat, &triplet).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn get_def_selects_the_smallest_interval() {
        let mut machine = ControlMachine::new(catalogue());
        let response =
            machine.handle_setup(&streaming_setup(UVC_GET_DEF, UVC_VS_PROBE_CONTROL));
        let control = StreamingControl::from_bytes(&response.data[..48]).unwrap();
        assert_eq!(control.frame_interval, 333_333);
        assert_eq!(response.length, 48);
    }

    #[test]
    fn probe_then_commit_yields_one_apply_action() {
        let mut machine = ControlMachine::new(catalogue());

        let response =
            machine.handle_setup(&streaming_setup(UVC_SET_CUR, UVC_VS_PROBE_CONTROL));
        assert_eq!(response.length, 48);

        let payload = StreamingControl {
            format_index: 1,
            frame_index: 1,
            frame_interval: 333_333,
            ..Default::default()
        }
        .to_bytes();
        assert!(machine.handle_data(&payload).is_none());

        let response =
            machine.handle_setup(&streaming_setup(UVC_GET_CUR, UVC_VS_PROBE_CONTROL));
        let probed = StreamingControl::from_bytes(&response.data[..48]).unwrap();
        assert_eq!(probed.format_index, 1);
        assert_eq!(probed.frame_index, 1);
        assert!(catalogue().frame(1, 1).unwrap().intervals.contains(&probed.frame_interval));
        assert_eq!(probed.max_payload_transfer_size, 3072);

        machine.handle_setup(&streaming_setup(UVC_SET_CUR, UVC_VS_COMMIT_CONTROL));
        let action = machine.handle_data(&payload).expect("commit action");
        assert_eq!(action.width, 1280);
        assert_eq!(action.height, 720);
        assert_eq!(action.fourcc, FOURCC_MJPEG);
        assert_eq!(action.fps, 30);
    }

    #[test]
    fn out_of_range_commit_clamps_to_the_catalogue_edge() {
        let mut machine = ControlMachine::new(catalogue());
        machine.handle_setup(&streaming_setup(UVC_SET_CUR, UVC_VS_PROBE_CONTROL));
        let payload = StreamingControl {
            format_index: 0xff,
            frame_index: 0xff,
            frame_interval: u32::MAX,
            ..Default::default()
        }
        .to_bytes();
        machine.handle_data(&payload);
        assert_eq!(machine.probe().format_index, 2);
        assert_eq!(machine.probe().frame_index, 1);
        assert_eq!(machine.probe().frame_interval, 333_333);
    }

    #[test]
    fn get_len_replies_the_corrected_little_endian_length() {
        let mut machine = ControlMachine::new(catalogue());
        let response =
            machine.handle_setup(&streaming_setup(UVC_GET_LEN, UVC_VS_PROBE_CONTROL));
        assert_eq!(response.length, 2);
        assert_eq!(&response.data[..2], &[0x30, 0x00]);
    }

    #[test]
    fn get_info_replies_get_and_set_support() {
        let mut machine = ControlMachine::new(catalogue());
        let response =
            machine.handle_setup(&streaming_setup(UVC_GET_INFO, UVC_VS_PROBE_CONTROL));
        assert_eq!(response.length, 1);
        assert_eq!(response.data[0], 0x3);
    }

    #[test]
    fn control_interface_requests_are_stubbed() {
        let mut machine = ControlMachine::new(catalogue());
        let setup = SetupRequest {
            request_type: USB_TYPE_CLASS | USB_RECIP_INTERFACE,
            request: UVC_GET_CUR,
            value: 0x0100,
            index: CONTROL_INTERFACE as u16,
            length: 26,
        };
        let response = machine.handle_setup(&setup);
        assert_eq!(response.length, 26);
        assert_eq!(response.data[0], 0x3);
    }

    #[test]
    fn data_without_set_cur_is_ignored() {
        let mut machine = ControlMachine::new(catalogue());
        let payload = StreamingControl {
            format_index: 1,
            frame_index: 1,
            frame_interval: 333_333,
            ..Default::default()
        }
        .to_bytes();
        assert!(machine.handle_data(&payload).is_none());
        assert_eq!(machine.probe(), &StreamingControl::default());
    }

    #[test]
    fn reset_zeroes_the_negotiation_state() {
        let mut machine = ControlMachine::new(catalogue());
        machine.handle_setup(&streaming_setup(UVC_SET_CUR, UVC_VS_PROBE_CONTROL));
        let payload = StreamingControl {
            format_index: 1,
            frame_index: 1,
            frame_interval: 333_333,
            ..Default::default()
        }
        .to_bytes();
        machine.handle_data(&payload);
        machine.reset();
        assert_eq!(machine.probe(), &StreamingControl::default());
        assert_eq!(machine.commit(), &StreamingControl::default());
    }
}
