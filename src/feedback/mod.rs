
use log::warn;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use util::marshal::Marshal;

use crate::codecs::MediaKind;
use crate::session::Session;

/// Cadence of full-bitrate REMBs once the ramp-up is over.
const REMB_INTERVAL_MS: u64 = 5_000;

/// video_frame drives the feedback governor: called once per inbound video
/// packet of a recording session, it ramps REMB up over the first packets,
/// then re-asserts the target every five seconds, and requests a keyframe
/// every keyframe interval.
pub(crate) fn video_frame(session: &Session, media_ssrc: u32) {
    let target = session.video_bitrate();
    let bitrate = if let Some(remaining) = session.take_remb_step() {
        Some(target / remaining)
    } else if session.remb_due(REMB_INTERVAL_MS) {
        Some(target)
    } else {
        None
    };
    if let Some(bitrate) = bitrate {
        let remb = ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 1,
            bitrate: bitrate as f32,
            ssrcs: vec![media_ssrc],
        };
        match remb.marshal() {
            Ok(data) => session.transport.send_rtcp(MediaKind::Video, &data),
            Err(e) => warn!("cannot marshal remb: {e}"),
        }
    }

    if session.pli_due() {
        let pli = PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc,
        };
        match pli.marshal() {
            Ok(data) => session.transport.send_rtcp(MediaKind::Video, &data),
            Err(e) => warn!("cannot marshal pli: {e}"),
        }
    }
}
