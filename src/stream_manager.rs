use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RelayConfig};
use crate::errors::{Result, StreamError};
use crate::ffmpeg_args::{self, SessionContext};
use crate::pipeline::MediaPipeline;
use crate::rtp::{AudioParameters, SessionId, SetupEndpoints, SetupEndpointsResponse, VideoParameters};
use crate::rtp_relay::{RelayEndpoint, RelayHandle, RtpRelay};
use crate::snapshot::{self, Snapshot, SnapshotCache, SnapshotSource};

const PORT_ALLOCATION_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Prepared,
    Streaming,
    Suspended,
    Stopped,
}

/// One negotiated stream: its parameters, relay and pipeline processes.
pub struct StreamSession {
    id: SessionId,
    setup: SetupEndpoints,
    response: SetupEndpointsResponse,
    relay_endpoint: RelayEndpoint,
    state: SessionState,
    pipeline: MediaPipeline,
    relay: Option<RelayHandle>,
}

impl StreamSession {
    async fn start(&mut self, config: &Config, video: &VideoParameters, audio: &AudioParameters) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Err(StreamError::session_not_found(&self.id));
        }
        if self.pipeline.is_running() || self.relay.is_some() {
            info!("Session {} is already started, restarting it", self.id);
            self.halt().await;
        }

        let ctx = SessionContext {
            config: &config.streaming,
            setup: &self.setup,
            response: &self.response,
            relay: &self.relay_endpoint,
        };
        let invocation = ffmpeg_args::synthesize(&ctx, video, audio);
        for problem in &invocation.unsupported {
            warn!("Session {}: {}", self.id, problem);
        }
        debug!("Session {} encode: {}", self.id, invocation.encode.command_line());
        debug!("Session {} decode: {}", self.id, invocation.decode.command_line());

        self.relay = Some(RtpRelay::launch(self.relay_endpoint.clone(), config.relay.clone()));

        self.pipeline.start(&invocation.encode, &invocation.decode).await?;
        self.state = SessionState::Streaming;
        info!(
            "Session {} streaming {}x{}@{} to {}",
            self.id,
            video.attributes.width,
            video.attributes.height,
            video.attributes.framerate,
            self.setup.controller.ip
        );
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.pipeline.suspend()?;
        self.state = SessionState::Suspended;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.pipeline.resume()?;
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Stop the relay and reap both processes.
    async fn halt(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.stop().await;
        }
        self.pipeline.stop().await;
    }
}

struct SessionEntry {
    ports: (u16, u16),
    session: Arc<Mutex<StreamSession>>,
}

/// Registry of streaming sessions and the snapshot callback.
///
/// The table lock is only held to insert, look up or remove entries.
/// Lifecycle calls on one session are serialized by that session's own lock,
/// so slow process or socket work never blocks other sessions.
#[derive(Clone)]
pub struct StreamManager {
    config: Arc<Config>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
    snapshots: Arc<SnapshotCache>,
}

impl StreamManager {
    pub fn new(config: Config) -> Self {
        let source = snapshot::source_from_config(&config.snapshot.source, &config.streaming);
        Self::with_snapshot_source(config, source)
    }

    pub fn with_snapshot_source(config: Config, source: Arc<dyn SnapshotSource>) -> Self {
        let snapshots = Arc::new(SnapshotCache::new(source, &config.snapshot));
        Self {
            config: Arc::new(config),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            snapshots,
        }
    }

    /// Register a session for a setup request. Nothing is spawned or bound
    /// yet. An existing session with the same id is stopped and replaced.
    pub async fn prepare_session(&self, setup: SetupEndpoints, response: SetupEndpointsResponse) -> Result<SessionId> {
        let id = if setup.session_id.is_empty() {
            SessionId::generate()
        } else {
            SessionId::new(setup.session_id.clone())
        };

        let replaced = {
            let mut sessions = self.sessions.lock().await;
            let taken: HashSet<u16> = sessions
                .iter()
                .filter(|(existing, _)| **existing != id)
                .flat_map(|(_, entry)| [entry.ports.0, entry.ports.1])
                .collect();
            let ports = allocate_relay_ports(&self.config.relay, &taken)?;

            let relay_endpoint = RelayEndpoint::new(response.audio_rtp_port, &setup.controller, ports.0, ports.1);
            info!(
                "Preparing session {} for controller {} (relay port {}, local ports {} and {})",
                id, relay_endpoint.controller, relay_endpoint.bind_port, ports.0, ports.1
            );

            let streaming = &self.config.streaming;
            let session = StreamSession {
                id: id.clone(),
                setup,
                response,
                relay_endpoint,
                state: SessionState::Prepared,
                pipeline: MediaPipeline::new(streaming.verbose, streaming.stop_grace_period),
                relay: None,
            };
            sessions.insert(
                id.clone(),
                SessionEntry {
                    ports,
                    session: Arc::new(Mutex::new(session)),
                },
            )
        };

        if let Some(old) = replaced {
            warn!("Session {} was prepared again, stopping the previous one", id);
            let mut old = old.session.lock().await;
            old.halt().await;
            old.state = SessionState::Stopped;
        }

        Ok(id)
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn active_session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn session_state(&self, id: &SessionId) -> Option<SessionState> {
        let session = self.session(id).await?;
        let state = session.lock().await.state;
        Some(state)
    }

    /// Local relay ports allocated to the session.
    pub async fn relay_ports(&self, id: &SessionId) -> Option<(u16, u16)> {
        self.sessions.lock().await.get(id).map(|entry| entry.ports)
    }

    async fn session(&self, id: &SessionId) -> Option<Arc<Mutex<StreamSession>>> {
        self.sessions.lock().await.get(id).map(|entry| entry.session.clone())
    }

    /// Launch the relay and both pipeline processes. The session stays
    /// registered when the pipeline fails to start, so the caller may retry
    /// or stop it.
    pub async fn start_session(&self, id: &SessionId, video: &VideoParameters, audio: &AudioParameters) -> Result<()> {
        let session = self.session(id).await.ok_or_else(|| {
            info!("start: session {} not found", id);
            StreamError::session_not_found(id)
        })?;

        let mut session = session.lock().await;
        session.start(&self.config, video, audio).await.map_err(|e| {
            error!("Failed to start session {}: {}", id, e);
            e
        })
    }

    /// Stop and forget the session. Unknown ids are only logged.
    pub async fn stop_session(&self, id: &SessionId) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(id)
        };

        match removed {
            Some(entry) => {
                let mut session = entry.session.lock().await;
                session.halt().await;
                session.state = SessionState::Stopped;
                info!("Session {} stopped", id);
            }
            None => info!("stop: session {} not found", id),
        }
    }

    pub async fn suspend_session(&self, id: &SessionId) {
        let Some(session) = self.session(id).await else {
            info!("suspend: session {} not found", id);
            return;
        };

        let mut session = session.lock().await;
        match session.suspend() {
            Ok(()) => info!("Session {} suspended", id),
            Err(e) => warn!("suspend: session {}: {}", id, e),
        }
    }

    pub async fn resume_session(&self, id: &SessionId) {
        let Some(session) = self.session(id).await else {
            info!("resume: session {} not found", id);
            return;
        };

        let mut session = session.lock().await;
        match session.resume() {
            Ok(()) => info!("Session {} resumed", id),
            Err(e) => warn!("resume: session {}: {}", id, e),
        }
    }

    /// Changing parameters of a running session is not supported; the
    /// session is left untouched.
    pub async fn reconfigure_session(&self, id: &SessionId, video: &VideoParameters, _audio: &AudioParameters) -> Result<()> {
        if self.session(id).await.is_none() {
            info!("reconfigure: session {} not found", id);
            return Err(StreamError::session_not_found(id));
        }

        info!(
            "reconfigure of session {} to {}x{} is not implemented",
            id, video.attributes.width, video.attributes.height
        );
        Err(StreamError::NotImplemented { operation: "reconfigure" })
    }

    /// Still image for the transport's snapshot callback. Independent of
    /// any session.
    pub async fn snapshot(&self, width: u32, height: u32) -> Result<Snapshot> {
        self.snapshots.snapshot(width, height).await
    }

    /// Stop every registered session.
    pub async fn shutdown(&self) {
        let ids = self.active_session_ids().await;
        info!("Stopping {} active session(s)", ids.len());
        for id in ids {
            self.stop_session(&id).await;
        }
    }
}

/// Pick one port from each range, avoiding ports used by other sessions.
fn allocate_relay_ports(config: &RelayConfig, taken: &HashSet<u16>) -> Result<(u16, u16)> {
    let mut rng = rand::thread_rng();
    let mut pick = |range: &Range<u16>| {
        (0..PORT_ALLOCATION_ATTEMPTS)
            .map(|_| rng.gen_range(range.clone()))
            .find(|port| !taken.contains(port))
    };

    let port1 = pick(&config.port1_range);
    let port2 = pick(&config.port2_range);
    match (port1, port2) {
        (Some(port1), Some(port2)) if port1 != port2 => Ok((port1, port2)),
        _ => Err(StreamError::relay(format!(
            "No free relay ports in {:?} and {:?}",
            config.port1_range, config.port2_range
        ))),
    }
}
