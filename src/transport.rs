use async_trait::async_trait;
use serde_json::Value;

use crate::codecs::MediaKind;
use crate::control::Jsep;

/// PeerTransport is the seam to the RTP/RTCP transport and signalling host
/// that owns the actual peer connection. The engine never touches the wire
/// itself: recorded packets come in through [`crate::RecordPlay::incoming_rtp`]
/// and replayed ones leave through this trait.
///
/// `send_rtp` and `send_rtcp` are called from latency-sensitive paths and
/// must hand the packet off without blocking.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Relay one outbound RTP packet to the peer.
    fn send_rtp(&self, kind: MediaKind, packet: &[u8]);

    /// Relay one outbound RTCP packet toward the peer.
    fn send_rtcp(&self, kind: MediaKind, packet: &[u8]);

    /// Deliver an asynchronous event for this session, with an optional
    /// JSEP payload to forward to the peer.
    async fn push_event(&self, transaction: &str, body: Value, jsep: Option<Jsep>);

    /// Ask the signalling host to tear the peer connection down. The host
    /// answers with a `hangup_media` call once the transport is gone.
    async fn close_peer(&self);
}

/// EventSink receives lifecycle observability events when the engine is
/// configured with `events = true`.
pub trait EventSink: Send + Sync {
    fn event(&self, body: Value);
}
