//! webrtc-rs implementation of the session transport

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::h264::{H264Sink, RtpH264Source};
use super::mdns::{default_mdns_host_name, mdns_mode, mdns_mode_label};
use super::signaling::SessionDescription;
use super::transport::{
    EventReceiver, EventSender, InboundTrack, PeerTransport, TrackKind, TransportEvent,
    TransportFactory, TransportState,
};
use crate::config::EncoderConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::frame::VIDEO_CLOCK_RATE;
use crate::video::track::FrameSink;

/// Stream id shared by every outbound track
const STREAM_ID: &str = "face-relay";

/// H.264 profiles offered by browsers that openh264 can decode
/// (payload type, fmtp line)
const H264_CODECS: &[(u8, &str)] = &[
    (
        102,
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
    ),
    (
        125,
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    ),
    (
        108,
        "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f",
    ),
];

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

/// Capability of the outbound track: constrained baseline, what openh264 emits
pub(crate) fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: H264_CODECS[1].1.to_owned(),
        rtcp_feedback: video_rtcp_feedback(),
    }
}

/// H.264-only media engine; audio m-lines are answered as rejected
fn h264_media_engine() -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();
    for &(payload_type, fmtp) in H264_CODECS {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        clock_rate: VIDEO_CLOCK_RATE,
                        channels: 0,
                        sdp_fmtp_line: fmtp.to_owned(),
                        rtcp_feedback: video_rtcp_feedback(),
                    },
                    payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| AppError::WebRtcError(format!("Failed to register H.264 codec: {}", e)))?;
    }
    Ok(media_engine)
}

fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![];
    for stun_url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        // webrtc-rs refuses TURN entries without credentials
        if turn.username.is_empty() || turn.credential.is_empty() {
            warn!("Skipping TURN server {:?}: credentials missing", turn.urls);
            continue;
        }
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

/// Codec mismatches surface while answering; they are the offer's fault
fn answer_error(e: webrtc::Error) -> AppError {
    match e {
        webrtc::Error::ErrSenderWithNoCodecs | webrtc::Error::ErrNoCodecsAvailable => {
            AppError::InvalidOffer(format!("no H.264 profile in common: {}", e))
        }
        other => AppError::WebRtcError(format!("Failed to create answer: {}", other)),
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Builds one `RtcTransport` per session from the WebRTC and encoder settings
pub struct RtcTransportFactory {
    webrtc: WebRtcConfig,
    encoder: EncoderConfig,
    log_throttle_secs: u64,
}

impl RtcTransportFactory {
    pub fn new(webrtc: WebRtcConfig, encoder: EncoderConfig, log_throttle_secs: u64) -> Self {
        Self {
            webrtc,
            encoder,
            log_throttle_secs,
        }
    }

    async fn new_peer_connection(&self, session_id: &str) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = h264_media_engine()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(default_mdns_host_name(session_id));
        }
        debug!("Session {} mDNS mode: {}", session_id, mdns_mode_label(mode));

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&self.webrtc),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, session_id: &str) -> Result<(Arc<dyn PeerTransport>, EventReceiver)> {
        let pc = self.new_peer_connection(session_id).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Attach the outbound track now so the answer advertises it
        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            format!("video-{}", &session_id[..8.min(session_id.len())]),
            STREAM_ID.to_string(),
        ));
        let sender = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

        let keyframe_requested = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_sender_rtcp(sender, keyframe_requested.clone()));

        let sink = H264Sink::new(
            track,
            self.encoder.fps,
            self.encoder.keyframe_interval_secs,
            keyframe_requested,
        );

        let transport = RtcTransport {
            session_id: session_id.to_string(),
            pc,
            sink: Mutex::new(Some(Box::new(sink))),
            gathering_timeout: Duration::from_millis(self.webrtc.ice.gathering_timeout_ms),
            closed: AtomicBool::new(false),
        };
        transport.register_handlers(events_tx, self.log_throttle_secs);

        Ok((Arc::new(transport), events_rx))
    }
}

/// Drain RTCP from the outbound sender; raises the flag on PLI/FIR
///
/// Interceptors only see RTCP that is read, so this loop must run for the
/// sender's whole life. It ends when the sender is stopped.
async fn read_sender_rtcp(sender: Arc<RTCRtpSender>, keyframe_requested: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 1500];
    while let Ok((packets, _)) = sender.read(&mut buf).await {
        for packet in packets {
            let any = packet.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some()
                || any.downcast_ref::<FullIntraRequest>().is_some()
            {
                keyframe_requested.store(true, Ordering::Release);
            }
        }
    }
}

/// One `RTCPeerConnection` plus the outbound H.264 sink attached to it
pub struct RtcTransport {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    gathering_timeout: Duration,
    closed: AtomicBool,
}

impl RtcTransport {
    /// Forward connection state and new tracks onto the event channel
    ///
    /// The handlers never block and never hold a strong reference to the
    /// peer connection.
    fn register_handlers(&self, events: EventSender, log_throttle_secs: u64) {
        let state_events = events.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(state) = map_state(s) {
                    debug!("Peer {} connection state: {}", session_id, state);
                    let _ = state_events.send(TransportEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));

        let pc = Arc::downgrade(&self.pc);
        let session_id = self.session_id.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                info!(
                    "Peer {} remote {:?} track {} ({})",
                    session_id,
                    kind,
                    track.id(),
                    track.codec().capability.mime_type
                );

                if kind == TrackKind::Video {
                    match RtpH264Source::new(&track, pc.clone(), LogThrottler::with_secs(log_throttle_secs)) {
                        Ok(source) => {
                            let _ = events.send(TransportEvent::TrackAdded(InboundTrack {
                                id: track.id(),
                                kind,
                                source: Box::new(source),
                            }));
                        }
                        Err(e) => warn!("Peer {} cannot decode track {}: {}", session_id, track.id(), e),
                    }
                }
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn set_remote_description(&self, offer: &SessionDescription) -> Result<()> {
        let offer = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| AppError::InvalidOffer(format!("malformed sdp: {}", e)))?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(answer_error)?;

        // Non-trickle: the answer must carry every local candidate
        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "Peer {} ICE gathering not complete after {:?}, answering with partial candidates",
                self.session_id, self.gathering_timeout
            );
        }

        let local = self.pc.local_description().await.ok_or_else(|| {
            AppError::WebRtcError("local description missing after negotiation".to_string())
        })?;
        Ok(SessionDescription::answer(local.sdp))
    }

    fn take_video_sink(&self) -> Option<Box<dyn FrameSink>> {
        self.sink.lock().take()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        debug!("Peer {} connection closed", self.session_id);
        Ok(())
    }
}
