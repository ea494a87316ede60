use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::errors::{Result, StreamError};
use crate::ffmpeg_args::ProcessSpec;
use crate::process_control::{terminate_and_wait, ProcessControl};

/// The encode and decode processes of one session.
pub struct MediaPipeline {
    verbose: bool,
    stop_grace_period: Duration,
    encode: Option<Child>,
    decode: Option<Child>,
}

impl MediaPipeline {
    /// `verbose` routes the processes' stdout/stderr to ours instead of
    /// discarding it.
    pub fn new(verbose: bool, stop_grace_period: Duration) -> Self {
        Self {
            verbose,
            stop_grace_period,
            encode: None,
            decode: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.encode.is_some() || self.decode.is_some()
    }

    /// Process ids of the processes currently held.
    pub fn pids(&self) -> Vec<u32> {
        [&self.encode, &self.decode]
            .into_iter()
            .flatten()
            .filter_map(|child| child.id())
            .collect()
    }

    fn output(&self) -> Stdio {
        if self.verbose {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    }

    async fn spawn(&self, spec: &ProcessSpec) -> Result<Child> {
        debug!("Spawning {}", spec.command_line());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(self.output())
            .stderr(self.output())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::pipeline_spawn(&spec.program, e))?;

        if let (Some(text), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            // stdin is closed when dropped so the reader sees EOF
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                warn!("Failed to write stdin of {}: {}", spec.program, e);
            }
        }

        info!("Started {} (pid {:?})", spec.program, child.id());
        Ok(child)
    }

    /// Spawn both processes. Each handle whose spawn succeeded is recorded,
    /// so a later `stop` reaches it even when this returns an error. The
    /// encode failure takes precedence over the decode failure.
    pub async fn start(&mut self, encode: &ProcessSpec, decode: &ProcessSpec) -> Result<()> {
        if self.is_running() {
            warn!("Pipeline already running, stopping it before restart");
            self.stop().await;
        }

        let encode_result = self.spawn(encode).await;
        let decode_result = self.spawn(decode).await;

        let mut first_error = None;
        match encode_result {
            Ok(child) => self.encode = Some(child),
            Err(e) => {
                error!("Encode process failed to start: {}", e);
                first_error = Some(e);
            }
        }
        match decode_result {
            Ok(child) => self.decode = Some(child),
            Err(e) => {
                error!("Decode process failed to start: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Interrupt and reap both processes. Safe to call with nothing running.
    pub async fn stop(&mut self) {
        let grace = self.stop_grace_period;
        for (name, slot) in [("encode", &mut self.encode), ("decode", &mut self.decode)] {
            if let Some(mut child) = slot.take() {
                match terminate_and_wait(&mut child, grace).await {
                    Ok(status) => debug!("{} process exited with {}", name, status),
                    Err(e) => error!("Failed to stop {} process: {}", name, e),
                }
            }
        }
    }

    pub fn suspend(&self) -> Result<()> {
        self.signal_all("suspend", |child| child.pause())
    }

    pub fn resume(&self) -> Result<()> {
        self.signal_all("resume", |child| child.resume())
    }

    fn signal_all(&self, action: &str, signal: impl Fn(&Child) -> std::io::Result<()>) -> Result<()> {
        if !self.is_running() {
            return Err(StreamError::PipelineNotRunning);
        }

        let mut first_error = None;
        for child in [&self.encode, &self.decode].into_iter().flatten() {
            if let Err(e) = signal(child) {
                warn!("Failed to {} process {:?}: {}", action, child.id(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process_control::process_exists;

    fn spec(program: &str, args: &[&str], stdin: Option<&str>) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: stdin.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_reaps_both_processes() {
        let mut pipeline = MediaPipeline::new(false, Duration::from_secs(5));
        pipeline
            .start(&spec("sleep", &["30"], None), &spec("sleep", &["30"], None))
            .await
            .unwrap();
        assert!(pipeline.is_running());
        let pids = pipeline.pids();
        assert_eq!(pids.len(), 2);
        assert!(pids.iter().all(|pid| process_exists(*pid)));

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        assert!(pipeline.pids().is_empty());
        for pid in pids {
            assert!(!process_exists(pid), "process {} still running after stop", pid);
        }

        // a second stop has nothing to do
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_decode_receives_stdin_text() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("sdp.txt");
        let script = format!("cat > {}", out.display());

        let mut pipeline = MediaPipeline::new(false, Duration::from_secs(5));
        pipeline
            .start(&spec("sleep", &["30"], None), &spec("sh", &["-c", &script], Some("v=0\nm=audio 4000\n")))
            .await
            .unwrap();

        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&out).unwrap_or_default();
            if !content.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(content, "v=0\nm=audio 4000\n");

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_encode_spawn_failure_is_reported_and_decode_still_tracked() {
        let mut pipeline = MediaPipeline::new(false, Duration::from_secs(5));
        let result = pipeline
            .start(&spec("/nonexistent/ffmpeg", &[], None), &spec("sleep", &["30"], None))
            .await;

        match result {
            Err(StreamError::PipelineSpawn { program, .. }) => assert_eq!(program, "/nonexistent/ffmpeg"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(pipeline.is_running());

        pipeline.stop().await;
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_suspend_without_processes() {
        let pipeline = MediaPipeline::new(false, Duration::from_secs(5));
        assert!(matches!(pipeline.suspend(), Err(StreamError::PipelineNotRunning)));
        assert!(matches!(pipeline.resume(), Err(StreamError::PipelineNotRunning)));
    }

    #[tokio::test]
    async fn test_suspend_resume_then_stop() {
        let mut pipeline = MediaPipeline::new(false, Duration::from_secs(5));
        pipeline
            .start(&spec("sleep", &["30"], None), &spec("sleep", &["30"], None))
            .await
            .unwrap();

        pipeline.suspend().unwrap();
        pipeline.resume().unwrap();
        pipeline.suspend().unwrap();
        let pids = pipeline.pids();

        // stopping a suspended pipeline must not hang
        tokio::time::timeout(Duration::from_secs(10), pipeline.stop()).await.unwrap();
        assert!(!pipeline.is_running());
        assert!(pids.iter().all(|pid| !process_exists(*pid)));
    }
}
