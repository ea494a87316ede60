use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hkcam_stream::config::Config;
use hkcam_stream::rtp::{
    AudioBitrateMode, AudioCodec, AudioCodecParameters, AudioParameters, AudioSampleRate, ControllerAddress,
    H264Level, H264Profile, RtpParameters, SetupEndpoints, SetupEndpointsResponse, SrtpParameters,
    VideoAttributes, VideoCodec, VideoCodecParameters, VideoParameters,
};
use hkcam_stream::StreamManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera accessory streaming back end")]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Debug logging and ffmpeg output on our stdout/stderr
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture one snapshot and write it as JPEG
    Snapshot {
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        #[arg(long)]
        output: PathBuf,
    },

    /// Stream to a controller until interrupted
    Stream {
        #[arg(long)]
        controller: IpAddr,
        #[arg(long)]
        video_port: u16,
        #[arg(long)]
        audio_port: u16,
        /// Base64 SRTP master key followed by salt
        #[arg(long)]
        video_key: String,
        #[arg(long)]
        audio_key: String,
        #[arg(long, default_value_t = 1280)]
        width: u32,
        #[arg(long, default_value_t = 720)]
        height: u32,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Video bitrate in kbps
        #[arg(long, default_value_t = 2000)]
        bitrate: u32,
        #[arg(long, default_value_t = 99)]
        video_payload_type: u8,
        #[arg(long, default_value_t = 110)]
        audio_payload_type: u8,
        #[arg(long, default_value_t = 24)]
        audio_bitrate: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "hkcam_stream=debug,info"
    } else {
        "hkcam_stream=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        warn!("Could not load {}: {}, using default configuration", args.config, e);
        Config::default()
    });
    config.streaming.verbose |= args.verbose;

    let manager = StreamManager::new(config);

    match args.command {
        Command::Snapshot { width, height, output } => {
            let snapshot = manager.snapshot(width, height).await?;
            std::fs::write(&output, &snapshot.jpeg)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                "Wrote {}x{} snapshot to {}",
                snapshot.width,
                snapshot.height,
                output.display()
            );
        }
        Command::Stream {
            controller,
            video_port,
            audio_port,
            video_key,
            audio_key,
            width,
            height,
            fps,
            bitrate,
            video_payload_type,
            audio_payload_type,
            audio_bitrate,
        } => {
            let setup = SetupEndpoints {
                session_id: String::new(),
                controller: ControllerAddress {
                    ip: controller,
                    video_rtp_port: video_port,
                    audio_rtp_port: audio_port,
                },
                video: SrtpParameters::from_srtp_key(&video_key)?,
                audio: SrtpParameters::from_srtp_key(&audio_key)?,
            };
            let accessory_ip = local_ip_for(controller);
            let response = SetupEndpointsResponse::echoing(&setup, accessory_ip, rand::random(), rand::random());

            let video = VideoParameters {
                codec: VideoCodec::H264,
                codec_params: VideoCodecParameters {
                    profiles: vec![H264Profile::Main],
                    levels: vec![H264Level::Level4],
                },
                attributes: VideoAttributes { width, height, framerate: fps },
                rtp: RtpParameters { payload_type: video_payload_type, bitrate },
            };
            let audio = AudioParameters {
                codec: AudioCodec::AacEld,
                codec_params: AudioCodecParameters {
                    bitrate_mode: AudioBitrateMode::Variable,
                    sample_rate: AudioSampleRate::Khz16,
                },
                rtp: RtpParameters { payload_type: audio_payload_type, bitrate: audio_bitrate },
            };

            let id = manager.prepare_session(setup, response).await?;
            if let Err(e) = manager.start_session(&id, &video, &audio).await {
                error!("Failed to start streaming: {}", e);
                manager.shutdown().await;
                return Err(e.into());
            }

            info!("Streaming session {}, press ctrl-c to stop", id);
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            manager.shutdown().await;
        }
    }

    Ok(())
}

/// Address of the interface that routes to the controller.
fn local_ip_for(controller: IpAddr) -> IpAddr {
    let bind: IpAddr = match controller {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    std::net::UdpSocket::bind((bind, 0))
        .and_then(|socket| {
            socket.connect((controller, 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(bind)
}
