//! Streaming back end for a camera accessory: negotiated sessions drive an
//! ffmpeg encode/decode pipeline, a UDP relay for two-way audio and a cached
//! snapshot source.

pub mod config;
pub mod errors;
pub mod ffmpeg_args;
pub mod pipeline;
pub mod process_control;
pub mod rtp;
pub mod rtp_relay;
pub mod snapshot;
pub mod stream_manager;
pub mod test_pattern;

pub use config::Config;
pub use errors::{Result, StreamError};
pub use stream_manager::{SessionState, StreamManager};
