//! Maps negotiated stream parameters onto the command lines of the two
//! pipeline processes. Everything here is pure: no I/O, no state.
//!
//! Values outside the recognized sets never abort synthesis. The offending
//! flag is left out and the problem is recorded in
//! [`PipelineInvocation::unsupported`] so the caller can log it.

use crate::config::{Platform, StreamingConfig};
use crate::errors::{Result, StreamError};
use crate::rtp::{
    AudioBitrateMode, AudioCodec, AudioParameters, AudioSampleRate, H264Level, H264Profile, IpVersion,
    SetupEndpoints, SetupEndpointsResponse, VideoAttributes, VideoCodec, VideoCodecParameters,
    VideoParameters,
};
use crate::rtp_relay::RelayEndpoint;

pub const SRTP_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";
pub const AUDIO_PACKET_SIZE: u32 = 188;
/// Payload type announced in the SDP handed to the decode process.
pub const DECODE_PAYLOAD_TYPE: u8 = 110;
const DECODE_CLOCK_RATE: u32 = 16000;
const AAC_ELD_FMTP: &str =
    "profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3; config=F8F0212C00BC00";

/// One external process to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the process's standard input right after spawn.
    pub stdin: Option<String>,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Value following `flag`, if the flag is present.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

#[derive(Debug)]
pub struct PipelineInvocation {
    pub encode: ProcessSpec,
    pub decode: ProcessSpec,
    pub unsupported: Vec<StreamError>,
}

/// Everything about a session the synthesizer needs besides the negotiated
/// parameters.
pub struct SessionContext<'a> {
    pub config: &'a StreamingConfig,
    pub setup: &'a SetupEndpoints,
    pub response: &'a SetupEndpointsResponse,
    pub relay: &'a RelayEndpoint,
}

#[derive(Default)]
struct ArgList(Vec<String>);

impl ArgList {
    fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    fn opt(&mut self, flag: &str, value: impl ToString) -> &mut Self {
        self.0.push(flag.to_string());
        self.0.push(value.to_string());
        self
    }
}

pub fn synthesize(ctx: &SessionContext<'_>, video: &VideoParameters, audio: &AudioParameters) -> PipelineInvocation {
    let mut unsupported = Vec::new();
    let mut note = |result: Result<()>| {
        if let Err(e) = result {
            unsupported.push(e);
        }
    };

    let cfg = ctx.config;
    let mut args = ArgList::default();

    // Video capture and SRTP output towards the controller
    args.arg("-hide_banner")
        .opt("-f", &cfg.video_device)
        .opt("-framerate", capture_framerate(cfg, &video.attributes))
        .args(video_decoder_option(cfg, video.codec));

    match cfg.platform {
        Platform::Linux => args.opt("-i", &cfg.video_filename),
        Platform::MacOs => args.opt("-i", format!("{}:{}", cfg.video_filename, cfg.audio_input)),
    };

    args.arg("-an");
    note(video_encoder(cfg, video.codec).map(|encoder| {
        args.opt("-codec:v", encoder);
    }));

    if cfg.platform == Platform::MacOs {
        args.opt("-pix_fmt", "yuv420p").opt("-vsync", "vfr");
    }

    // height -2 keeps the aspect ratio
    args.opt("-preset", "ultrafast")
        .opt("-tune", "zerolatency")
        .opt("-vf", format!("scale={}:-2", video.attributes.width))
        .opt("-r", video.attributes.framerate);

    note(video_level(&video.codec_params).map(|level| {
        args.opt("-level:v", level);
    }));

    // only the Linux encoders honor the profile
    if cfg.platform == Platform::Linux {
        note(video_profile(&video.codec_params).map(|profile| {
            args.opt("-profile:v", profile);
        }));
    }

    let controller = &ctx.setup.controller;
    args.opt("-b:v", format!("{}k", video_bitrate(cfg, video)))
        .opt("-payload_type", video.rtp.payload_type)
        .opt("-ssrc", ctx.response.ssrc_video)
        .opt("-f", "rtp")
        .opt("-srtp_out_suite", SRTP_SUITE)
        .opt("-srtp_out_params", ctx.setup.video.srtp_key())
        .arg(format!(
            "srtp://{}:{port}?rtcpport={port}&localrtcpport={port}&pkt_size={}&timeout=60",
            controller.url_host(),
            video_mtu(controller.ip_version()),
            port = controller.video_rtp_port,
        ));

    // Audio capture, sent through the relay
    args.opt("-fflags", "nobuffer")
        .opt("-flags", "low_delay")
        .opt("-probesize", 32)
        .opt("-analyzeduration", 0);
    if cfg.platform == Platform::Linux {
        args.opt("-f", &cfg.audio_device).opt("-i", &cfg.audio_input);
    }
    args.arg("-vn");

    let codec_option = audio_codec_option(audio.codec).unwrap_or_else(|e| {
        note(Err(e));
        Vec::new()
    });
    args.args(codec_option.iter().copied());
    if audio.codec == AudioCodec::Opus {
        note(audio_variable_bitrate(audio.codec_params.bitrate_mode).map(|vbr| {
            args.opt("-vbr", vbr);
        }));
    }
    args.opt("-flags", "+global_header");

    let sample_rate = audio_sample_rate(audio.codec_params.sample_rate).map_err(|e| note(Err(e))).ok();
    if let Some(rate) = sample_rate {
        args.opt("-ar", rate);
    }

    let relay = ctx.relay;
    args.opt("-b:a", format!("{}k", audio.rtp.bitrate))
        .opt("-bufsize", "48k")
        .opt("-ac", 1)
        .opt("-payload_type", audio.rtp.payload_type)
        .opt("-ssrc", ctx.response.ssrc_audio)
        .opt("-f", "rtp")
        .opt("-srtp_out_suite", SRTP_SUITE)
        .opt("-srtp_out_params", ctx.setup.audio.srtp_key())
        .arg(format!(
            "srtp://127.0.0.1:{bind}?rtcpport={bind}&localrtcpport={}&pkt_size={}&timeout=60",
            relay.local_port1,
            AUDIO_PACKET_SIZE,
            bind = relay.bind_port,
        ));

    let encode = ProcessSpec {
        program: cfg.ffmpeg_path.clone(),
        args: args.0,
        stdin: None,
    };

    // Inbound controller audio, described by an SDP on stdin
    let mut args = ArgList::default();
    args.arg("-hide_banner")
        .opt("-fflags", "nobuffer")
        .opt("-flags", "low_delay")
        .opt("-probesize", 32)
        .opt("-analyzeduration", 0)
        .opt("-protocol_whitelist", "rtp,srtp,crypto,file,udp,pipe")
        .opt("-f", "sdp")
        .arg("-vn")
        .args(codec_option.iter().copied())
        .opt("-flags", "+global_header")
        .opt("-i", "pipe:");

    let program = match cfg.platform {
        Platform::Linux => {
            args.opt("-f", &cfg.audio_device).arg(&cfg.audio_output);
            if let Some(rate) = sample_rate {
                args.opt("-async", rate);
            }
            cfg.ffmpeg_path.clone()
        }
        Platform::MacOs => {
            // ffmpeg has no AudioToolbox output, play through ffplay instead
            args.arg("-nodisp").opt("-sync", "ext");
            cfg.ffplay_path.clone()
        }
    };

    let decode = ProcessSpec {
        program,
        args: args.0,
        stdin: Some(audio_sdp(relay.local_port2, audio.rtp.bitrate, &ctx.setup.audio.srtp_key())),
    };

    PipelineInvocation { encode, decode, unsupported }
}

/// Session description for the decode process. The stream always arrives
/// as AAC-ELD on a fixed payload type.
pub fn audio_sdp(port: u16, bitrate: u32, srtp_key: &str) -> String {
    format!(
        "v=0\n\
         o=- 0 0 IN IP4 127.0.0.1\n\
         s=No Name\n\
         c=IN IP4 127.0.0.1\n\
         t=0 0\n\
         m=audio {port} RTP/AVP {pt}\n\
         b=AS:{bitrate}\n\
         a=rtpmap:{pt} MPEG4-GENERIC/{clock}/1\n\
         a=fmtp:{pt} {fmtp}\n\
         a=crypto:1 {suite} inline:{key}\n",
        port = port,
        pt = DECODE_PAYLOAD_TYPE,
        bitrate = bitrate,
        clock = DECODE_CLOCK_RATE,
        fmtp = AAC_ELD_FMTP,
        suite = SRTP_SUITE,
        key = srtp_key,
    )
}

pub fn video_encoder(cfg: &StreamingConfig, codec: VideoCodec) -> Result<&str> {
    match codec {
        VideoCodec::H264 => Ok(&cfg.h264_encoder),
        other => Err(StreamError::unsupported("video codec", other)),
    }
}

pub fn video_decoder_option(cfg: &StreamingConfig, codec: VideoCodec) -> Vec<String> {
    match (codec, &cfg.h264_decoder) {
        (VideoCodec::H264, Some(decoder)) if !decoder.is_empty() => {
            vec!["-codec:v".to_string(), decoder.clone()]
        }
        _ => Vec::new(),
    }
}

pub fn video_bitrate(cfg: &StreamingConfig, video: &VideoParameters) -> u32 {
    video.rtp.bitrate.max(cfg.min_video_bitrate)
}

/// avfoundation only delivers 30 fps whatever is requested.
pub fn capture_framerate(cfg: &StreamingConfig, attributes: &VideoAttributes) -> u32 {
    if cfg.video_device == "avfoundation" {
        30
    } else {
        attributes.framerate
    }
}

/// First recognized profile in the offered list.
pub fn video_profile(params: &VideoCodecParameters) -> Result<&'static str> {
    params
        .profiles
        .iter()
        .find_map(|profile| match profile {
            H264Profile::ConstrainedBaseline => Some("baseline"),
            H264Profile::Main => Some("main"),
            H264Profile::High => Some("high"),
            H264Profile::Unsupported(_) => None,
        })
        .ok_or_else(|| StreamError::unsupported("video profile", &params.profiles))
}

/// First recognized level in the offered list.
pub fn video_level(params: &VideoCodecParameters) -> Result<&'static str> {
    params
        .levels
        .iter()
        .find_map(|level| match level {
            H264Level::Level3_1 => Some("3.1"),
            H264Level::Level3_2 => Some("3.2"),
            H264Level::Level4 => Some("4.0"),
            H264Level::Unsupported(_) => None,
        })
        .ok_or_else(|| StreamError::unsupported("video level", &params.levels))
}

pub fn video_mtu(version: IpVersion) -> u32 {
    match version {
        IpVersion::V4 => 1378,
        IpVersion::V6 => 1228,
    }
}

/// Encoder/decoder selection for the negotiated audio codec.
pub fn audio_codec_option(codec: AudioCodec) -> Result<Vec<&'static str>> {
    match codec {
        // requires ffmpeg built with --enable-libfdk-aac
        AudioCodec::AacEld => Ok(vec!["-acodec", "libfdk_aac", "-aprofile", "aac_eld"]),
        AudioCodec::Opus => Ok(vec!["-codec:a", "libopus"]),
        other => Err(StreamError::unsupported("audio codec", other)),
    }
}

pub fn audio_variable_bitrate(mode: AudioBitrateMode) -> Result<&'static str> {
    match mode {
        AudioBitrateMode::Variable => Ok("on"),
        AudioBitrateMode::Constant => Ok("off"),
        other => Err(StreamError::unsupported("audio bitrate mode", other)),
    }
}

pub fn audio_sample_rate(rate: AudioSampleRate) -> Result<&'static str> {
    match rate {
        AudioSampleRate::Khz8 => Ok("8k"),
        AudioSampleRate::Khz16 => Ok("16k"),
        AudioSampleRate::Khz24 => Ok("24k"),
        other => Err(StreamError::unsupported("audio sample rate", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{AudioCodecParameters, ControllerAddress, RtpParameters, SrtpParameters};

    fn setup(ip: &str) -> SetupEndpoints {
        SetupEndpoints {
            session_id: "session".to_string(),
            controller: ControllerAddress {
                ip: ip.parse().unwrap(),
                video_rtp_port: 51000,
                audio_rtp_port: 51002,
            },
            video: SrtpParameters { master_key: vec![1; 16], master_salt: vec![2; 14] },
            audio: SrtpParameters { master_key: vec![3; 16], master_salt: vec![4; 14] },
        }
    }

    fn response(setup: &SetupEndpoints) -> SetupEndpointsResponse {
        SetupEndpointsResponse::echoing(setup, "192.168.1.10".parse().unwrap(), 1111, 2222)
    }

    fn relay(setup: &SetupEndpoints) -> RelayEndpoint {
        RelayEndpoint::new(setup.controller.audio_rtp_port, &setup.controller, 3456, 4567)
    }

    fn video() -> VideoParameters {
        VideoParameters {
            codec: VideoCodec::H264,
            codec_params: VideoCodecParameters {
                profiles: vec![H264Profile::High],
                levels: vec![H264Level::Level4],
            },
            attributes: VideoAttributes { width: 1280, height: 960, framerate: 30 },
            rtp: RtpParameters { payload_type: 99, bitrate: 300 },
        }
    }

    fn audio(codec: AudioCodec) -> AudioParameters {
        AudioParameters {
            codec,
            codec_params: AudioCodecParameters {
                bitrate_mode: AudioBitrateMode::Variable,
                sample_rate: AudioSampleRate::Khz16,
            },
            rtp: RtpParameters { payload_type: 110, bitrate: 24 },
        }
    }

    fn run(cfg: &StreamingConfig, setup: &SetupEndpoints, video: &VideoParameters, audio: &AudioParameters) -> PipelineInvocation {
        let response = response(setup);
        let relay = relay(setup);
        let ctx = SessionContext { config: cfg, setup, response: &response, relay: &relay };
        synthesize(&ctx, video, audio)
    }

    #[test]
    fn test_linux_h264_high_profile_with_bitrate_floor() {
        let mut cfg = StreamingConfig::for_platform(Platform::Linux);
        cfg.min_video_bitrate = 500;
        let setup = setup("192.168.1.20");

        let invocation = run(&cfg, &setup, &video(), &audio(AudioCodec::AacEld));
        let encode = &invocation.encode;

        assert!(invocation.unsupported.is_empty());
        assert_eq!(encode.program, "ffmpeg");
        assert_eq!(encode.arg_value("-profile:v"), Some("high"));
        assert_eq!(encode.arg_value("-level:v"), Some("4.0"));
        assert_eq!(encode.arg_value("-b:v"), Some("500k"));
        assert_eq!(encode.arg_value("-codec:v"), Some("h264_omx"));
        assert_eq!(encode.arg_value("-vf"), Some("scale=1280:-2"));
        assert_eq!(encode.arg_value("-i"), Some("/dev/video0"));
        assert_eq!(encode.arg_value("-ssrc"), Some("1111"));
        assert!(encode.has_arg(
            "srtp://192.168.1.20:51000?rtcpport=51000&localrtcpport=51000&pkt_size=1378&timeout=60"
        ));
        assert!(encode.has_arg(
            "srtp://127.0.0.1:51002?rtcpport=51002&localrtcpport=3456&pkt_size=188&timeout=60"
        ));
        assert!(encode.has_arg(&setup.video.srtp_key()));
        assert!(encode.has_arg(&setup.audio.srtp_key()));
        assert!(encode.has_arg("libfdk_aac"));
        assert_eq!(encode.arg_value("-ar"), Some("16k"));
    }

    #[test]
    fn test_bitrate_above_floor_is_kept() {
        let mut cfg = StreamingConfig::for_platform(Platform::Linux);
        cfg.min_video_bitrate = 100;
        assert_eq!(video_bitrate(&cfg, &video()), 300);
    }

    #[test]
    fn test_linux_decode_reads_sdp_from_stdin() {
        let cfg = StreamingConfig::for_platform(Platform::Linux);
        let setup = setup("192.168.1.20");

        let invocation = run(&cfg, &setup, &video(), &audio(AudioCodec::AacEld));
        let decode = &invocation.decode;

        assert_eq!(decode.program, "ffmpeg");
        assert_eq!(decode.arg_value("-i"), Some("pipe:"));
        assert_eq!(decode.arg_value("-async"), Some("16k"));
        assert!(decode.has_arg("alsa"));

        let sdp = decode.stdin.as_deref().unwrap();
        assert!(sdp.contains("m=audio 4567 RTP/AVP 110"));
        assert!(sdp.contains("b=AS:24"));
        assert!(sdp.contains("a=rtpmap:110 MPEG4-GENERIC/16000/1"));
        assert!(sdp.contains(&format!("inline:{}", setup.audio.srtp_key())));
    }

    #[test]
    fn test_macos_uses_ffplay_and_skips_profile() {
        let cfg = StreamingConfig::for_platform(Platform::MacOs);
        let setup = setup("192.168.1.20");
        let mut video = video();
        video.attributes.framerate = 15;

        let invocation = run(&cfg, &setup, &video, &audio(AudioCodec::AacEld));

        assert_eq!(invocation.decode.program, "ffplay");
        assert!(invocation.decode.has_arg("-nodisp"));
        assert_eq!(invocation.encode.arg_value("-profile:v"), None);
        assert_eq!(invocation.encode.arg_value("-pix_fmt"), Some("yuv420p"));
        assert_eq!(invocation.encode.arg_value("-framerate"), Some("30"));
        assert_eq!(invocation.encode.arg_value("-r"), Some("15"));
        assert_eq!(invocation.encode.arg_value("-i"), Some("default:default"));
        assert_eq!(invocation.encode.arg_value("-codec:v"), Some("libx264"));
    }

    #[test]
    fn test_ipv6_controller_uses_smaller_packets() {
        let cfg = StreamingConfig::for_platform(Platform::Linux);
        let setup = setup("fd00::2");

        let invocation = run(&cfg, &setup, &video(), &audio(AudioCodec::AacEld));

        assert!(invocation.encode.has_arg(
            "srtp://[fd00::2]:51000?rtcpport=51000&localrtcpport=51000&pkt_size=1228&timeout=60"
        ));
    }

    #[test]
    fn test_unsupported_values_are_reported_not_emitted() {
        let mut cfg = StreamingConfig::for_platform(Platform::Linux);
        cfg.h264_decoder = Some("h264_mmal".to_string());
        let setup = setup("192.168.1.20");
        let mut video = video();
        video.codec = VideoCodec::Unsupported(1);
        video.codec_params.levels = vec![H264Level::Unsupported(7)];
        let mut audio = audio(AudioCodec::Pcmu);
        audio.codec_params.sample_rate = AudioSampleRate::Unsupported(9);

        let invocation = run(&cfg, &setup, &video, &audio);

        let parameters: Vec<&str> = invocation
            .unsupported
            .iter()
            .filter_map(|e| match e {
                StreamError::UnsupportedParameter { parameter, .. } => Some(*parameter),
                _ => None,
            })
            .collect();
        assert_eq!(parameters, vec!["video codec", "video level", "audio codec", "audio sample rate"]);

        let encode = &invocation.encode;
        assert_eq!(encode.arg_value("-codec:v"), None);
        assert_eq!(encode.arg_value("-level:v"), None);
        assert_eq!(encode.arg_value("-ar"), None);
        assert!(!encode.has_arg("-acodec"));
        assert_eq!(invocation.decode.arg_value("-async"), None);
    }

    #[test]
    fn test_h264_decoder_override_precedes_input() {
        let mut cfg = StreamingConfig::for_platform(Platform::Linux);
        cfg.h264_decoder = Some("h264_mmal".to_string());
        let setup = setup("192.168.1.20");

        let invocation = run(&cfg, &setup, &video(), &audio(AudioCodec::AacEld));
        let args = &invocation.encode.args;
        let decoder = args.iter().position(|a| a == "h264_mmal").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(decoder < input);
    }

    #[test]
    fn test_opus_sets_variable_bitrate() {
        let cfg = StreamingConfig::for_platform(Platform::Linux);
        let setup = setup("192.168.1.20");
        let mut audio = audio(AudioCodec::Opus);
        audio.codec_params.bitrate_mode = AudioBitrateMode::Constant;

        let invocation = run(&cfg, &setup, &video(), &audio);
        assert_eq!(invocation.encode.arg_value("-codec:a"), Some("libopus"));
        assert_eq!(invocation.encode.arg_value("-vbr"), Some("off"));
    }

    #[test]
    fn test_first_recognized_profile_wins() {
        let params = VideoCodecParameters {
            profiles: vec![H264Profile::Unsupported(5), H264Profile::Main, H264Profile::High],
            levels: vec![],
        };
        assert_eq!(video_profile(&params).unwrap(), "main");
        assert!(video_level(&params).is_err());
    }
}
