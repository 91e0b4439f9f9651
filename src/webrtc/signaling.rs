//! Session description exchange
//!
//! The browser posts `{"sdp": "...", "type": "offer"}` and gets back the
//! same shape with `"type": "answer"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::sdp::MediaDescription;

use crate::error::{AppError, Result};

/// Session description kinds of the offer/answer model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl SdpType {
    /// The description type a peer sends in reply to this one
    pub fn counterpart(self) -> Option<SdpType> {
        match self {
            SdpType::Offer => Some(SdpType::Answer),
            SdpType::Pranswer | SdpType::Answer => Some(SdpType::Offer),
            SdpType::Rollback => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::Pranswer),
            "answer" => Ok(SdpType::Answer),
            "rollback" => Ok(SdpType::Rollback),
            other => Err(AppError::InvalidOffer(format!(
                "unsupported description type '{}'",
                other
            ))),
        }
    }
}

/// A session description as carried over the HTTP API
///
/// `type` stays a plain string on the wire so an unknown value is reported
/// as an invalid offer rather than a JSON decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: sdp_type.as_str().to_string(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpType::Answer, sdp)
    }

    pub fn kind(&self) -> Result<SdpType> {
        self.sdp_type.parse()
    }

    /// Check that this is a well-formed offer
    ///
    /// Rejects an empty descriptor, any type other than `offer`, SDP text
    /// that does not parse, and offers without an active H.264 video
    /// section (the only media this relay can decode and send back).
    pub fn validate_offer(&self) -> Result<()> {
        if self.sdp.trim().is_empty() {
            return Err(AppError::InvalidOffer("empty sdp".to_string()));
        }

        let kind = self.kind()?;
        if kind != SdpType::Offer {
            return Err(AppError::InvalidOffer(format!(
                "expected an offer, got '{}'",
                kind
            )));
        }

        let parsed = RTCSessionDescription::offer(self.sdp.clone())
            .and_then(|desc| desc.unmarshal())
            .map_err(|e| AppError::InvalidOffer(format!("malformed sdp: {}", e)))?;

        if !parsed.media_descriptions.iter().any(offers_h264_video) {
            return Err(AppError::InvalidOffer(
                "offer has no H.264 video section".to_string(),
            ));
        }
        Ok(())
    }
}

/// Active `m=video` section with at least one `a=rtpmap:<pt> H264/<rate>`
fn offers_h264_video(media: &MediaDescription) -> bool {
    if media.media_name.media != "video" || media.media_name.port.value == 0 {
        return false;
    }
    media
        .attributes
        .iter()
        .filter(|attr| attr.key == "rtpmap")
        .filter_map(|attr| attr.value.as_deref())
        .filter_map(|value| value.split_whitespace().nth(1))
        .filter_map(|encoding| encoding.split('/').next())
        .any(|name| name.eq_ignore_ascii_case("H264"))
}
