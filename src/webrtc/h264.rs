//! H.264 media path between RTP and raw frames
//!
//! ```text
//! TrackRemote --read_rtp--> SampleBuilder<H264Packet> --Annex B--> openh264 Decoder
//!                                                                     |
//!                                                           I420 Frame (90 kHz pts)
//!
//! BGR24 Frame --to_i420--> openh264 Encoder --Annex B--> TrackLocalStaticSample
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::encoder::Encoder;
use openh264::formats::{YUVBuffer, YUVSource};
use rtp::codecs::h264::H264Packet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::convert;
use crate::video::frame::{Frame, PixelLayout, TimeBase, VIDEO_CLOCK_RATE};
use crate::video::track::{FrameSink, FrameSource};
use crate::warn_throttled;

/// Packets a sample may arrive late before the builder gives up on it
const SAMPLE_MAX_LATE: u16 = 512;

/// Minimum spacing between keyframe requests
const PLI_INTERVAL: Duration = Duration::from_secs(1);

/// Extends 32-bit RTP timestamps into a monotonic-ish 64-bit timeline
///
/// Each step is interpreted as the shortest signed distance from the
/// previous timestamp, so wraparound continues the count and reordering
/// steps back.
#[derive(Debug, Default)]
pub struct RtpTimestampUnwrapper {
    last: Option<(u32, i64)>,
}

impl RtpTimestampUnwrapper {
    pub fn unwrap(&mut self, timestamp: u32) -> i64 {
        let value = match self.last {
            None => timestamp as i64,
            Some((prev, prev_value)) => prev_value + timestamp.wrapping_sub(prev) as i32 as i64,
        };
        self.last = Some((timestamp, value));
        value
    }
}

/// Copy a possibly padded decoder picture into a tightly packed I420 buffer
fn pack_i420(yuv: &impl YUVSource) -> (Vec<u8>, u32, u32) {
    let (width, height) = yuv.dimensions();
    let (y_stride, u_stride, v_stride) = yuv.strides();
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));

    let mut out = Vec::with_capacity(width * height + 2 * cw * ch);
    for row in 0..height {
        out.extend_from_slice(&yuv.y()[row * y_stride..row * y_stride + width]);
    }
    for row in 0..ch {
        out.extend_from_slice(&yuv.u()[row * u_stride..row * u_stride + cw]);
    }
    for row in 0..ch {
        out.extend_from_slice(&yuv.v()[row * v_stride..row * v_stride + cw]);
    }
    (out, width as u32, height as u32)
}

/// Decoded frames from one inbound H.264 track
///
/// Holds only weak references: the remote track and the peer connection
/// belong to the transport.
pub struct RtpH264Source {
    track: Weak<TrackRemote>,
    pc: Weak<RTCPeerConnection>,
    ssrc: u32,
    builder: SampleBuilder<H264Packet>,
    decoder: Decoder,
    timestamps: RtpTimestampUnwrapper,
    throttler: LogThrottler,
    last_pli: Option<Instant>,
    ended: bool,
}

impl RtpH264Source {
    pub fn new(
        track: &Arc<TrackRemote>,
        pc: Weak<RTCPeerConnection>,
        throttler: LogThrottler,
    ) -> Result<Self> {
        let decoder = Decoder::new()
            .map_err(|e| AppError::VideoError(format!("Failed to create H.264 decoder: {}", e)))?;

        Ok(Self {
            track: Arc::downgrade(track),
            pc,
            ssrc: track.ssrc(),
            builder: SampleBuilder::new(SAMPLE_MAX_LATE, H264Packet::default(), VIDEO_CLOCK_RATE),
            decoder,
            timestamps: RtpTimestampUnwrapper::default(),
            throttler,
            last_pli: None,
            ended: false,
        })
    }

    /// Ask the sender for a fresh keyframe, at most once per `PLI_INTERVAL`
    async fn request_keyframe(&mut self) {
        if self.last_pli.is_some_and(|t| t.elapsed() < PLI_INTERVAL) {
            return;
        }
        let Some(pc) = self.pc.upgrade() else {
            return;
        };
        self.last_pli = Some(Instant::now());

        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
            debug!("Failed to send PLI for ssrc {}: {}", self.ssrc, e);
        } else {
            trace!("Sent PLI for ssrc {}", self.ssrc);
        }
    }

    /// Decode one access unit; `Ok(None)` while the decoder is still priming
    fn decode(&mut self, sample: &Sample) -> Result<Option<Frame>> {
        let decoded = self
            .decoder
            .decode(&sample.data)
            .map_err(|e| AppError::VideoError(format!("H.264 decode failed: {}", e)))?;

        let Some(yuv) = decoded else {
            return Ok(None);
        };
        let (data, width, height) = pack_i420(&yuv);
        let pts = self.timestamps.unwrap(sample.packet_timestamp);
        Frame::new(data, width, height, PixelLayout::I420, pts, TimeBase::video()).map(Some)
    }

    fn end(&mut self) -> AppError {
        self.ended = true;
        AppError::UpstreamEnded
    }
}

#[async_trait]
impl FrameSource for RtpH264Source {
    async fn recv(&mut self) -> Result<Frame> {
        if self.ended {
            return Err(AppError::UpstreamEnded);
        }
        if self.last_pli.is_none() {
            self.request_keyframe().await;
        }

        loop {
            while let Some(sample) = self.builder.pop() {
                if sample.prev_dropped_packets > 0 {
                    trace!("ssrc {}: {} packets dropped", self.ssrc, sample.prev_dropped_packets);
                }
                match self.decode(&sample) {
                    Ok(Some(frame)) => return Ok(frame),
                    Ok(None) => {}
                    Err(e) => {
                        warn_throttled!(self.throttler, "decode", "ssrc {}: {}", self.ssrc, e);
                        self.request_keyframe().await;
                    }
                }
            }

            let Some(track) = self.track.upgrade() else {
                return Err(self.end());
            };
            match track.read_rtp().await {
                Ok((packet, _)) => self.builder.push(packet),
                Err(e) => {
                    debug!("Inbound track {} ended: {}", track.id(), e);
                    return Err(self.end());
                }
            }
        }
    }
}

/// Encoder bound to the frame size it was created for
struct SizedEncoder {
    encoder: Encoder,
    width: u32,
    height: u32,
}

/// Encodes frames onto the outbound sample track
pub struct H264Sink {
    track: Arc<TrackLocalStaticSample>,
    encoder: Option<SizedEncoder>,
    fallback_duration: Duration,
    keyframe_interval: u64,
    keyframe_requested: Arc<AtomicBool>,
    last_pts: Option<i64>,
    frames: u64,
}

impl H264Sink {
    /// `keyframe_requested` is raised by the RTCP reader when the remote
    /// peer sends PLI or FIR.
    pub fn new(
        track: Arc<TrackLocalStaticSample>,
        fps: u32,
        keyframe_interval_secs: u32,
        keyframe_requested: Arc<AtomicBool>,
    ) -> Self {
        let fps = fps.max(1);
        Self {
            track,
            encoder: None,
            fallback_duration: Duration::from_micros(1_000_000 / fps as u64),
            keyframe_interval: (fps as u64 * keyframe_interval_secs.max(1) as u64).max(1),
            keyframe_requested,
            last_pts: None,
            frames: 0,
        }
    }

    /// Make sure an encoder sized for `width`x`height` exists
    fn prepare_encoder(&mut self, width: u32, height: u32) -> Result<()> {
        let stale = self
            .encoder
            .as_ref()
            .map_or(true, |e| e.width != width || e.height != height);
        if stale {
            let encoder = Encoder::new().map_err(|e| {
                AppError::VideoError(format!("Failed to create H.264 encoder: {}", e))
            })?;
            info!("Outbound H.264 encoder at {}x{}", width, height);
            self.encoder = Some(SizedEncoder {
                encoder,
                width,
                height,
            });
            // a new encoder starts with an IDR anyway
            self.frames = 0;
        }
        Ok(())
    }

    fn encode(&mut self, frame: Frame) -> Result<Vec<u8>> {
        let frame = convert::to_i420(crop_to_even(frame)?);
        let (width, height) = (frame.width(), frame.height());

        self.prepare_encoder(width, height)?;
        let force_keyframe = self.keyframe_requested.swap(false, Ordering::AcqRel)
            || (self.frames > 0 && self.frames % self.keyframe_interval == 0);
        self.frames += 1;

        let Some(sized) = self.encoder.as_mut() else {
            return Err(AppError::Internal("encoder missing".to_string()));
        };
        let encoder = &mut sized.encoder;
        if force_keyframe {
            encoder.force_intra_frame();
        }

        let yuv = YUVBuffer::from_vec(frame.into_data(), width as usize, height as usize);
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| AppError::VideoError(format!("H.264 encode failed: {}", e)))?;
        Ok(bitstream.to_vec())
    }
}

#[async_trait]
impl FrameSink for H264Sink {
    async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let duration = match self.last_pts {
            Some(prev) if frame.pts() > prev => frame.time_base().to_duration(frame.pts() - prev),
            _ => self.fallback_duration,
        };
        self.last_pts = Some(frame.pts());

        let data = self.encode(frame)?;
        if data.is_empty() {
            // encoder skipped the frame for rate control
            return Ok(());
        }

        let sample = Sample {
            data: Bytes::from(data),
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("write_sample failed: {}", e)))
    }
}

/// Drop a trailing odd row/column; H.264 4:2:0 needs even dimensions
fn crop_to_even(frame: Frame) -> Result<Frame> {
    let (w, h) = (frame.width() & !1, frame.height() & !1);
    if w == 0 || h == 0 {
        return Err(AppError::VideoError(format!(
            "frame {}x{} too small to encode",
            frame.width(),
            frame.height()
        )));
    }
    if w == frame.width() && h == frame.height() {
        return Ok(frame);
    }

    let frame = convert::to_bgr24(frame);
    let src_stride = frame.width() as usize * 3;
    let dst_stride = w as usize * 3;
    let mut data = Vec::with_capacity(dst_stride * h as usize);
    for row in frame.data().chunks_exact(src_stride).take(h as usize) {
        data.extend_from_slice(&row[..dst_stride]);
    }
    Frame::new(data, w, h, PixelLayout::Bgr24, frame.pts(), frame.time_base())
}
