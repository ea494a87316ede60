//! Parameter structures handed over by the accessory transport when a
//! controller negotiates a stream.
//!
//! Enumerated protocol values keep an `Unsupported` variant carrying the raw
//! value so that anything outside the recognized set can be reported.

use std::fmt;
use std::net::IpAddr;

use base64::Engine;

use crate::errors::{Result, StreamError};

const MASTER_KEY_LEN: usize = 16;

/// Opaque session identifier supplied by the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerAddress {
    pub ip: IpAddr,
    pub video_rtp_port: u16,
    pub audio_rtp_port: u16,
}

impl ControllerAddress {
    pub fn ip_version(&self) -> IpVersion {
        match self.ip {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Host part usable inside a URL (IPv6 literals are bracketed).
    pub fn url_host(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        }
    }
}

/// Per-stream SRTP key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpParameters {
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
}

impl SrtpParameters {
    /// Key and salt concatenated and base64 encoded, the form expected by
    /// `-srtp_out_params` and SDP `a=crypto` lines.
    pub fn srtp_key(&self) -> String {
        let mut material = Vec::with_capacity(self.master_key.len() + self.master_salt.len());
        material.extend_from_slice(&self.master_key);
        material.extend_from_slice(&self.master_salt);
        base64::engine::general_purpose::STANDARD.encode(material)
    }

    /// Split base64 key material back into the 16-byte master key and the
    /// remaining salt.
    pub fn from_srtp_key(encoded: &str) -> Result<Self> {
        let material = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| StreamError::config(format!("Invalid SRTP key: {}", e)))?;
        if material.len() <= MASTER_KEY_LEN {
            return Err(StreamError::config(format!(
                "SRTP key material is {} bytes, expected a {}-byte key followed by a salt",
                material.len(),
                MASTER_KEY_LEN
            )));
        }
        let (key, salt) = material.split_at(MASTER_KEY_LEN);
        Ok(Self {
            master_key: key.to_vec(),
            master_salt: salt.to_vec(),
        })
    }
}

impl fmt::Debug for SrtpParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpParameters")
            .field("master_key", &format_args!("[{} bytes]", self.master_key.len()))
            .field("master_salt", &format_args!("[{} bytes]", self.master_salt.len()))
            .finish()
    }
}

/// Session-setup request from the controller.
#[derive(Debug, Clone)]
pub struct SetupEndpoints {
    /// May be empty, in which case a fresh identifier is generated.
    pub session_id: String,
    pub controller: ControllerAddress,
    pub video: SrtpParameters,
    pub audio: SrtpParameters,
}

/// What the accessory answered to the setup request.
#[derive(Debug, Clone)]
pub struct SetupEndpointsResponse {
    pub accessory_ip: IpAddr,
    pub video_rtp_port: u16,
    pub audio_rtp_port: u16,
    pub ssrc_video: u32,
    pub ssrc_audio: u32,
}

impl SetupEndpointsResponse {
    /// Echo the controller's ports back, the way the accessory advertises them.
    pub fn echoing(setup: &SetupEndpoints, accessory_ip: IpAddr, ssrc_video: u32, ssrc_audio: u32) -> Self {
        Self {
            accessory_ip,
            video_rtp_port: setup.controller.video_rtp_port,
            audio_rtp_port: setup.controller.audio_rtp_port,
            ssrc_video,
            ssrc_audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Unsupported(u8),
}

impl VideoCodec {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::H264,
            other => Self::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    ConstrainedBaseline,
    Main,
    High,
    Unsupported(u8),
}

impl H264Profile {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::ConstrainedBaseline,
            1 => Self::Main,
            2 => Self::High,
            other => Self::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Level {
    Level3_1,
    Level3_2,
    Level4,
    Unsupported(u8),
}

impl H264Level {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Level3_1,
            1 => Self::Level3_2,
            2 => Self::Level4,
            other => Self::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodecParameters {
    pub profiles: Vec<H264Profile>,
    pub levels: Vec<H264Level>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoAttributes {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpParameters {
    pub payload_type: u8,
    /// Kilobits per second.
    pub bitrate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoParameters {
    pub codec: VideoCodec,
    pub codec_params: VideoCodecParameters,
    pub attributes: VideoAttributes,
    pub rtp: RtpParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Pcmu,
    Pcma,
    AacEld,
    Opus,
    Msbc,
    Amr,
    AmrWb,
    Unsupported(u8),
}

impl AudioCodec {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Pcmu,
            1 => Self::Pcma,
            2 => Self::AacEld,
            3 => Self::Opus,
            4 => Self::Msbc,
            5 => Self::Amr,
            6 => Self::AmrWb,
            other => Self::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSampleRate {
    Khz8,
    Khz16,
    Khz24,
    Unsupported(u8),
}

impl AudioSampleRate {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Khz8,
            1 => Self::Khz16,
            2 => Self::Khz24,
            other => Self::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioBitrateMode {
    Variable,
    Constant,
    Unsupported(u8),
}

impl AudioBitrateMode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Variable,
            1 => Self::Constant,
            other => Self::Unsupported(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodecParameters {
    pub bitrate_mode: AudioBitrateMode,
    pub sample_rate: AudioSampleRate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParameters {
    pub codec: AudioCodec,
    pub codec_params: AudioCodecParameters,
    pub rtp: RtpParameters,
}
