//! Streaming session engine
//!
//! A single driver task owns the peer connection, tracks, capture sources and
//! the lifecycle state. Callers talk to it through [`SessionEngine`]; slow work
//! (ICE gathering, the WHIP POST) runs in spawned tasks that report back with
//! the session epoch, so results for a torn-down session are ignored.
//!
//! ```text
//! start() ──► Starting ──► Negotiating ──answer──► Streaming
//!                 │              │                     │
//!                 └──────────────┴──── fatal / stop ───┴──► Stopping ──► Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::SessionState;
use crate::audio::AudioPump;
use crate::capture::{
    open_audio_input, select_audio_source, AudioFormat, CaptureGrant, CapturePlatform,
    DisplaySpec, EffectiveAudio, VideoBridge,
};
use crate::config::{SessionParameters, StreamerConfig};
use crate::error::{AppError, Result, SignalingError};
use crate::events::{EventBus, SessionEvent, StopReason};
use crate::sdp;
use crate::webrtc::{
    apply_sender_bitrates, AudioTrack, BitrateTargets, PeerFactory, PeerHandle, RtcEngine,
    Signaling, VideoTrack, WhipClient,
};

/// Collaborators the engine drives
pub struct SessionDeps {
    pub peers: Arc<dyn PeerFactory>,
    pub signaling: Arc<dyn Signaling>,
    pub platform: Arc<dyn CapturePlatform>,
    pub config: StreamerConfig,
}

enum Command {
    Start {
        params: SessionParameters,
        grant: Option<CaptureGrant>,
        reply: oneshot::Sender<Result<String>>,
    },
    Stop,
    /// Completion of session work, tagged with the session epoch
    Session { epoch: u64, signal: SessionSignal },
}

enum SessionSignal {
    Answer(std::result::Result<String, SignalingError>),
    OfferFailed(AppError),
    ConnectionLost(String),
    CaptureLost(String),
    Reenforce { attempt: u32 },
}

/// Handle to the session driver
///
/// Dropping the handle stops any active session.
pub struct SessionEngine {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl SessionEngine {
    /// Spawn the driver over the given collaborators
    pub fn new(deps: SessionDeps) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let events = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();

        let driver = Driver {
            deps,
            commands: commands.clone(),
            state: state_tx,
            events: events.clone(),
            epoch: 0,
            session: None,
        };
        tokio::spawn(driver.run(rx, shutdown.clone()));

        Self {
            commands,
            state,
            events,
            shutdown,
        }
    }

    /// Engine backed by the shared webrtc-rs engine and the HTTP WHIP client
    pub async fn with_platform(config: StreamerConfig, platform: Arc<dyn CapturePlatform>) -> Result<Self> {
        let peers = RtcEngine::shared(&config.ice).await?;
        let signaling = Arc::new(WhipClient::new(&config.signaling)?);
        Ok(Self::new(SessionDeps {
            peers,
            signaling,
            platform,
            config,
        }))
    }

    /// Start a session
    ///
    /// Returns the session id once capture and the local offer are set up; the
    /// rest of the lifecycle is reported through [`subscribe`](Self::subscribe).
    /// An active session is stopped first.
    pub async fn start(&self, params: SessionParameters, grant: Option<CaptureGrant>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                params,
                grant,
                reply,
            })
            .map_err(|_| AppError::Internal("Session driver is not running".to_string()))?;
        rx.await
            .map_err(|_| AppError::Internal("Session driver dropped the start request".to_string()))?
    }

    /// Request a stop; returns immediately
    ///
    /// Safe from any state and any number of times.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Resources of the session in flight
struct ActiveSession {
    id: String,
    epoch: u64,
    params: SessionParameters,
    targets: BitrateTargets,
    /// Cancels spawned negotiation and watcher tasks
    cancel: CancellationToken,
    peer: Option<Arc<dyn PeerHandle>>,
    grant: Option<CaptureGrant>,
    bridge: Option<VideoBridge>,
    video: Option<Arc<VideoTrack>>,
    audio: Option<Arc<AudioTrack>>,
    pump: Option<AudioPump>,
}

struct Driver {
    deps: SessionDeps,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Sender<SessionState>,
    events: Arc<EventBus>,
    epoch: u64,
    session: Option<ActiveSession>,
}

fn validate(params: &SessionParameters, grant: Option<&CaptureGrant>) -> Result<()> {
    if params.endpoint.trim().is_empty() {
        return Err(AppError::Config("Ingest URL is empty".to_string()));
    }
    if grant.is_none() {
        return Err(AppError::Config("Screen capture authorization missing".to_string()));
    }
    Ok(())
}

fn stop_reason_for(err: &AppError) -> StopReason {
    match err {
        AppError::Capture(_) => StopReason::CaptureLost,
        AppError::StrictCodecUnavailable(_) => StopReason::StrictCodecUnavailable,
        AppError::Signaling(SignalingError::RemoteRejected { .. }) => StopReason::RemoteRejected,
        AppError::Signaling(_) => StopReason::SignalingFailed,
        _ => StopReason::NegotiationFailed,
    }
}

/// Offer munging, applied to the created offer and again to the gathered description
fn munge_offer(offer: &str, params: &SessionParameters) -> String {
    let offer = sdp::set_opus_target_bitrate(offer, params.audio_bitrate_kbps.max(6));
    sdp::prefer_video_codec(&offer, params.video_codec)
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Start {
                    params,
                    grant,
                    reply,
                } => {
                    let result = self.handle_start(params, grant).await;
                    let _ = reply.send(result);
                }
                Command::Stop => self.handle_stop().await,
                Command::Session { epoch, signal } => {
                    if self.session.as_ref().map(|s| s.epoch) != Some(epoch) {
                        debug!("Dropping message for stale session epoch {}", epoch);
                        continue;
                    }
                    self.handle_signal(signal).await;
                }
            }
        }

        self.teardown(StopReason::UserRequested, Some("engine shut down".to_string()))
            .await;
        debug!("Session driver exited");
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let current = self.current_state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("Ignoring illegal session transition {} -> {}", current, next);
            return;
        }
        self.state.send_replace(next);
        info!("Session state: {} -> {}", current, next);

        if let Some(session) = &self.session {
            self.events.publish(SessionEvent::StateChanged {
                session_id: session.id.clone(),
                state: next,
            });
        }
    }

    fn post(&self, epoch: u64, signal: SessionSignal) {
        let _ = self.commands.send(Command::Session { epoch, signal });
    }

    async fn handle_start(&mut self, params: SessionParameters, grant: Option<CaptureGrant>) -> Result<String> {
        if let Err(e) = validate(&params, grant.as_ref()) {
            warn!("Rejecting session start: {}", e);
            if self.session.is_none() {
                self.set_state(SessionState::Stopped);
            }
            return Err(e);
        }

        if self.session.is_some() {
            info!("New session requested, stopping the current one");
            self.teardown(
                StopReason::UserRequested,
                Some("replaced by a new session".to_string()),
            )
            .await;
        }

        self.epoch += 1;
        let id = uuid::Uuid::new_v4().to_string();
        let targets = BitrateTargets {
            video_kbps: params.video_bitrate_kbps,
            fps: params.fps,
            audio_kbps: params.audio_bitrate_kbps,
        };
        info!(
            "Starting session {}: {}x{}@{} {} {}kbps, audio {} {}kbps",
            id,
            params.width,
            params.height,
            params.fps,
            params.video_codec,
            params.video_bitrate_kbps,
            params.audio_mode,
            params.audio_bitrate_kbps
        );

        self.session = Some(ActiveSession {
            id: id.clone(),
            epoch: self.epoch,
            params,
            targets,
            cancel: CancellationToken::new(),
            peer: None,
            grant,
            bridge: None,
            video: None,
            audio: None,
            pump: None,
        });
        self.set_state(SessionState::Starting);

        if let Err(e) = self.negotiate().await {
            error!("Session {} failed to start: {}", id, e);
            self.teardown(stop_reason_for(&e), Some(e.to_string())).await;
        }
        Ok(id)
    }

    /// Starting -> Negotiating: capture, tracks, local offer, then hand off the POST
    async fn negotiate(&mut self) -> Result<()> {
        let platform = self.deps.platform.clone();
        let engine_caps = self.deps.config.engine.clone();
        let peers = self.deps.peers.clone();
        let signaling = self.deps.signaling.clone();
        let commands = self.commands.clone();

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| AppError::Internal("No session to negotiate".to_string()))?;
        let params = session.params.clone();
        let epoch = session.epoch;
        let authorization = session
            .grant
            .as_ref()
            .map(|g| g.authorization())
            .ok_or_else(|| AppError::Config("Screen capture authorization missing".to_string()))?;

        let peer = peers.create_peer(&session.id).await?;
        session.peer = Some(peer.clone());

        // Screen video
        let video = Arc::new(VideoTrack::new(params.video_codec, "video"));
        session.video = Some(video.clone());
        let mut bridge = VideoBridge::new(
            authorization.clone(),
            DisplaySpec {
                width: params.width,
                height: params.height,
                fps: params.fps,
                codec: params.video_codec,
                encoder_mode: params.encoder_mode,
                bitrate_bps: params.video_bitrate_kbps.max(1).saturating_mul(1000),
            },
        );
        let lost_tx = commands.clone();
        let started = bridge
            .start(
                video.clone(),
                Box::new(move |reason| {
                    let _ = lost_tx.send(Command::Session {
                        epoch,
                        signal: SessionSignal::CaptureLost(reason),
                    });
                }),
            )
            .await;
        session.bridge = Some(bridge);
        started?;

        // Audio
        let effective = select_audio_source(params.audio_mode, platform.capabilities());
        if let Some((source, input)) = open_audio_input(
            effective,
            platform,
            Some(authorization),
            &engine_caps,
            AudioFormat::STANDARD,
        )
        .await?
        {
            let audio = Arc::new(AudioTrack::new("audio"));
            session.pump = Some(AudioPump::spawn(
                input,
                audio.clone(),
                params.audio_bitrate_kbps.max(6),
            )?);
            session.audio = Some(audio);
            debug!("Audio track uses {}", source);
        } else {
            debug!("Audio {}", EffectiveAudio::Disabled);
        }

        peer.add_send_only(video.outbound()).await?;
        if let Some(audio) = &session.audio {
            peer.add_send_only(audio.outbound()).await?;
        }
        apply_sender_bitrates(peer.as_ref(), session.targets).await;

        let offer = peer.create_offer().await?;
        let offer = munge_offer(&offer, &params);
        peer.set_local_offer(&offer).await?;
        apply_sender_bitrates(peer.as_ref(), session.targets).await;

        // Connection loss watcher
        let mut states = peer.state_watch();
        let cancel = session.cancel.clone();
        let state_tx = commands.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        if state.is_lost() {
                            let _ = state_tx.send(Command::Session {
                                epoch,
                                signal: SessionSignal::ConnectionLost(format!("peer connection {}", state)),
                            });
                            break;
                        }
                    }
                }
            }
        });

        // Gather, re-munge and POST off the driver
        let cancel = session.cancel.clone();
        let credential = params.credential.clone();
        let endpoint = params.endpoint.clone();
        tokio::spawn(async move {
            let exchange = async {
                let gathered = match peer.gathered_local_description().await {
                    Ok(sdp) => munge_offer(&sdp, &params),
                    Err(e) => return SessionSignal::OfferFailed(e),
                };
                SessionSignal::Answer(
                    signaling
                        .send_offer(&endpoint, credential.as_deref(), &gathered)
                        .await,
                )
            };
            tokio::select! {
                _ = cancel.cancelled() => debug!("Signaling cancelled"),
                signal = exchange => {
                    let _ = commands.send(Command::Session { epoch, signal });
                }
            }
        });

        self.set_state(SessionState::Negotiating);
        Ok(())
    }

    async fn handle_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Answer(Ok(answer)) => {
                if self.current_state() != SessionState::Negotiating {
                    debug!("Ignoring answer outside negotiation");
                    return;
                }
                if let Err(e) = self.apply_answer(&answer).await {
                    error!("Failed to apply answer: {}", e);
                    self.teardown(stop_reason_for(&e), Some(e.to_string())).await;
                }
            }
            SessionSignal::Answer(Err(e)) => {
                error!("WHIP exchange failed: {}", e);
                let err = AppError::from(e);
                self.teardown(stop_reason_for(&err), Some(err.to_string())).await;
            }
            SessionSignal::OfferFailed(e) => {
                error!("Local offer failed: {}", e);
                self.teardown(StopReason::NegotiationFailed, Some(e.to_string()))
                    .await;
            }
            SessionSignal::ConnectionLost(detail) => {
                if self.current_state().is_active() {
                    warn!("Connection lost: {}", detail);
                    self.teardown(StopReason::ConnectionLost, Some(detail)).await;
                }
            }
            SessionSignal::CaptureLost(detail) => {
                warn!("Capture lost: {}", detail);
                self.teardown(StopReason::CaptureLost, Some(detail)).await;
            }
            SessionSignal::Reenforce { attempt } => self.enforce_after_answer(attempt).await,
        }
    }

    /// Negotiating -> Streaming
    ///
    /// Without strict codec mode an answer lacking the requested codec is still
    /// applied. The local track cannot bind to a codec the answer leaves out, so
    /// the engine usually rejects such an answer and the session ends as
    /// `negotiation-failed`.
    async fn apply_answer(&mut self, answer: &str) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| AppError::Internal("No session for answer".to_string()))?;
        let codec = session.params.video_codec;

        if session.params.strict_codec && !sdp::has_video_codec(answer, codec) {
            return Err(AppError::StrictCodecUnavailable(codec));
        }
        if !sdp::has_video_codec(answer, codec) {
            warn!(
                "Answer does not offer {}; applying it anyway, the video track may fail to bind",
                codec
            );
        }

        let answer = sdp::restrict_video_codec_if_present(answer, codec);
        let peer = session
            .peer
            .clone()
            .ok_or_else(|| AppError::Internal("No peer for answer".to_string()))?;
        peer.set_remote_answer(&answer).await?;

        let session_id = session.id.clone();
        self.enforce_after_answer(1).await;
        self.set_state(SessionState::Streaming);
        self.events.publish(SessionEvent::Streaming { session_id, codec });
        info!("Streaming {} to ingest server", codec);
        Ok(())
    }

    /// Authoritative enforcement, retried while senders are not ready
    async fn enforce_after_answer(&mut self, attempt: u32) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(peer) = &session.peer else {
            return;
        };

        let report = apply_sender_bitrates(peer.as_ref(), session.targets).await;
        if report.is_complete() {
            debug!("Sender limits applied on attempt {}", attempt);
            return;
        }

        let policy = &self.deps.config.enforcement;
        if attempt >= policy.max_attempts {
            warn!(
                "Sender limits incomplete after {} attempts: {:?}",
                attempt, report
            );
            return;
        }

        let epoch = session.epoch;
        let cancel = session.cancel.clone();
        let delay = Duration::from_millis(policy.retry_delay_ms);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::Session {
                        epoch,
                        signal: SessionSignal::Reenforce { attempt: attempt + 1 },
                    });
                }
            }
        });
    }

    async fn handle_stop(&mut self) {
        if self.session.is_none() {
            debug!("Stop requested with no active session");
            return;
        }
        self.teardown(StopReason::UserRequested, None).await;
    }

    /// Stopping -> Stopped, releasing in a fixed order
    ///
    /// Runs at most once per session: the session is taken out of the driver first.
    async fn teardown(&mut self, reason: StopReason, detail: Option<String>) {
        if self.session.is_none() {
            return;
        }
        self.set_state(SessionState::Stopping);
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!("Stopping session {} ({})", session.id, reason);

        session.cancel.cancel();

        if let Some(mut bridge) = session.bridge.take() {
            bridge.stop().await;
        }
        if let Some(pump) = session.pump.take() {
            pump.stop().await;
        }
        if let Some(video) = session.video.take() {
            let stats = video.stats();
            info!(
                "Video sent: {} frames ({} keyframes, {} bytes), {} dropped, {} errors",
                stats.frames_sent, stats.keyframes_sent, stats.bytes_sent, stats.frames_dropped, stats.errors
            );
        }
        if let Some(audio) = session.audio.take() {
            let stats = audio.stats();
            info!(
                "Audio sent: {} packets ({} bytes), {} errors",
                stats.frames_sent, stats.bytes_sent, stats.errors
            );
        }

        if let Some(grant) = session.grant.take() {
            grant.stop().await;
        }
        if let Some(peer) = session.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("Error closing peer connection: {}", e);
            }
        }

        // Publish under the ended session's id
        let session_id = session.id.clone();
        let current = self.current_state();
        if current.can_transition_to(SessionState::Stopped) {
            self.state.send_replace(SessionState::Stopped);
            info!("Session state: {} -> {}", current, SessionState::Stopped);
        }
        self.events.publish(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state: SessionState::Stopped,
        });
        self.events.publish(SessionEvent::Stopped {
            session_id,
            reason,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{
        AudioInput, CaptureAuthorization, EncodedVideoFrame, PlatformCapabilities, VirtualDisplay,
    };
    use crate::config::{AudioMode, EnforcementSettings, VideoCodec};
    use crate::webrtc::{ConnectionState, EncodingParameters, MediaKind, OutboundTrack, SenderHandle};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ANSWER_H264_VP8: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 packetization-mode=1\r\n";

    const ANSWER_VP8_ONLY: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=rtpmap:96 VP8/90000\r\n";

    const OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:102 H264/90000\r\n";

    /// Shared record of side effects, in order
    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().push(entry.into());
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
        fn count(&self, entry: &str) -> usize {
            self.0.lock().iter().filter(|e| e.as_str() == entry).count()
        }
    }

    struct MockSender {
        kind: MediaKind,
        journal: Arc<Journal>,
        encodings: Mutex<Vec<EncodingParameters>>,
    }

    #[async_trait]
    impl SenderHandle for MockSender {
        fn kind(&self) -> MediaKind {
            self.kind
        }
        async fn parameters(&self) -> Vec<EncodingParameters> {
            self.journal.push(format!("sender.read {}", self.kind));
            self.encodings.lock().clone()
        }
        async fn set_parameters(&self, encodings: Vec<EncodingParameters>) -> Result<()> {
            self.journal.push(format!("sender.set {}", self.kind));
            *self.encodings.lock() = encodings;
            Ok(())
        }
    }

    struct MockPeer {
        journal: Arc<Journal>,
        encodings_per_sender: usize,
        senders: Mutex<Vec<Arc<MockSender>>>,
        local: Mutex<Option<String>>,
        remote: Mutex<Option<String>>,
        state: watch::Sender<ConnectionState>,
    }

    #[async_trait]
    impl PeerHandle for MockPeer {
        async fn add_send_only(&self, track: OutboundTrack) -> Result<()> {
            self.journal.push(format!("peer.add {}", track.kind));
            self.senders.lock().push(Arc::new(MockSender {
                kind: track.kind,
                journal: self.journal.clone(),
                encodings: Mutex::new(vec![EncodingParameters::default(); self.encodings_per_sender]),
            }));
            Ok(())
        }
        async fn create_offer(&self) -> Result<String> {
            Ok(OFFER.to_string())
        }
        async fn set_local_offer(&self, sdp: &str) -> Result<()> {
            *self.local.lock() = Some(sdp.to_string());
            Ok(())
        }
        async fn gathered_local_description(&self) -> Result<String> {
            self.local
                .lock()
                .clone()
                .ok_or_else(|| AppError::Negotiation("no local description".to_string()))
        }
        async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
            self.journal.push("peer.set_remote");
            *self.remote.lock() = Some(sdp.to_string());
            Ok(())
        }
        async fn senders(&self) -> Vec<Arc<dyn SenderHandle>> {
            self.senders
                .lock()
                .iter()
                .map(|s| s.clone() as Arc<dyn SenderHandle>)
                .collect()
        }
        fn state_watch(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }
        async fn close(&self) -> Result<()> {
            self.journal.push("peer.close");
            Ok(())
        }
    }

    struct MockPeers {
        journal: Arc<Journal>,
        /// Zero models senders whose encodings are not populated yet
        encodings_per_sender: AtomicUsize,
        last: Mutex<Option<Arc<MockPeer>>>,
    }

    #[async_trait]
    impl PeerFactory for MockPeers {
        async fn create_peer(&self, _session_id: &str) -> Result<Arc<dyn PeerHandle>> {
            let peer = Arc::new(MockPeer {
                journal: self.journal.clone(),
                encodings_per_sender: self.encodings_per_sender.load(Ordering::SeqCst),
                senders: Mutex::new(Vec::new()),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                state: watch::channel(ConnectionState::New).0,
            });
            *self.last.lock() = Some(peer.clone());
            Ok(peer)
        }
    }

    struct MockSignaling {
        journal: Arc<Journal>,
        reply: std::result::Result<String, SignalingError>,
        delay: Duration,
        offers: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Signaling for MockSignaling {
        async fn send_offer(
            &self,
            endpoint: &str,
            credential: Option<&str>,
            offer: &str,
        ) -> std::result::Result<String, SignalingError> {
            self.journal.push(format!(
                "signaling.post {}",
                crate::webrtc::build_target_url(endpoint, credential)
            ));
            self.offers.lock().push(offer.to_string());
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    struct MockInput {
        name: &'static str,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl AudioInput for MockInput {
        fn format(&self) -> AudioFormat {
            AudioFormat::STANDARD
        }
        async fn read_frame(&mut self) -> Result<Option<Vec<i16>>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Some(vec![0; AudioFormat::STANDARD.samples_per_frame()]))
        }
        fn close(&mut self) {
            self.journal.push(format!("{}.close", self.name));
        }
    }

    struct MockDisplay {
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl VirtualDisplay for MockDisplay {
        fn set_bitrate(&self, _bitrate_bps: u32) {}
        async fn release(&self) {
            self.journal.push("display.release");
        }
    }

    struct MockAuthorization {
        journal: Arc<Journal>,
        terminated: watch::Sender<bool>,
        sink: Mutex<Option<mpsc::Sender<EncodedVideoFrame>>>,
    }

    #[async_trait]
    impl CaptureAuthorization for MockAuthorization {
        async fn create_virtual_display(
            &self,
            _spec: DisplaySpec,
            sink: mpsc::Sender<EncodedVideoFrame>,
        ) -> Result<Arc<dyn VirtualDisplay>> {
            self.journal.push("display.create");
            *self.sink.lock() = Some(sink);
            Ok(Arc::new(MockDisplay {
                journal: self.journal.clone(),
            }))
        }
        async fn create_loopback_input(&self, _format: AudioFormat) -> Result<Box<dyn AudioInput>> {
            self.journal.push("loopback.open");
            Ok(Box::new(MockInput {
                name: "loopback",
                journal: self.journal.clone(),
            }))
        }
        fn terminated(&self) -> watch::Receiver<bool> {
            self.terminated.subscribe()
        }
        async fn stop(&self) {
            self.journal.push("grant.stop");
        }
    }

    struct MockPlatform {
        journal: Arc<Journal>,
        loopback_capable: bool,
    }

    #[async_trait]
    impl CapturePlatform for MockPlatform {
        fn capabilities(&self) -> PlatformCapabilities {
            PlatformCapabilities {
                loopback_capable: self.loopback_capable,
            }
        }
        async fn open_microphone(&self, _format: AudioFormat) -> Result<Box<dyn AudioInput>> {
            self.journal.push("mic.open");
            Ok(Box::new(MockInput {
                name: "mic",
                journal: self.journal.clone(),
            }))
        }
    }

    struct Harness {
        engine: SessionEngine,
        journal: Arc<Journal>,
        peers: Arc<MockPeers>,
        signaling: Arc<MockSignaling>,
        authorization: Arc<MockAuthorization>,
    }

    impl Harness {
        fn new(reply: std::result::Result<String, SignalingError>, loopback_capable: bool) -> Self {
            Self::with_delay(reply, loopback_capable, Duration::ZERO)
        }

        fn with_delay(
            reply: std::result::Result<String, SignalingError>,
            loopback_capable: bool,
            delay: Duration,
        ) -> Self {
            Self::build(
                reply,
                loopback_capable,
                delay,
                EnforcementSettings {
                    max_attempts: 3,
                    retry_delay_ms: 10,
                },
            )
        }

        fn with_enforcement(
            reply: std::result::Result<String, SignalingError>,
            enforcement: EnforcementSettings,
        ) -> Self {
            Self::build(reply, true, Duration::ZERO, enforcement)
        }

        fn build(
            reply: std::result::Result<String, SignalingError>,
            loopback_capable: bool,
            delay: Duration,
            enforcement: EnforcementSettings,
        ) -> Self {
            let journal = Arc::new(Journal::default());
            let peers = Arc::new(MockPeers {
                journal: journal.clone(),
                encodings_per_sender: AtomicUsize::new(1),
                last: Mutex::new(None),
            });
            let signaling = Arc::new(MockSignaling {
                journal: journal.clone(),
                reply,
                delay,
                offers: Mutex::new(Vec::new()),
            });
            let platform = Arc::new(MockPlatform {
                journal: journal.clone(),
                loopback_capable,
            });
            let authorization = Arc::new(MockAuthorization {
                journal: journal.clone(),
                terminated: watch::channel(false).0,
                sink: Mutex::new(None),
            });
            let config = StreamerConfig {
                enforcement,
                ..Default::default()
            };

            let engine = SessionEngine::new(SessionDeps {
                peers: peers.clone(),
                signaling: signaling.clone(),
                platform,
                config,
            });
            Self {
                engine,
                journal,
                peers,
                signaling,
                authorization,
            }
        }

        fn grant(&self) -> Option<CaptureGrant> {
            Some(CaptureGrant::new(self.authorization.clone()))
        }

        fn peer(&self) -> Arc<MockPeer> {
            self.peers.last.lock().clone().unwrap()
        }
    }

    fn params(codec: VideoCodec, strict: bool, audio: AudioMode) -> SessionParameters {
        SessionParameters {
            endpoint: "https://ingest.example/whip/".to_string(),
            credential: Some("abc123".to_string()),
            audio_mode: audio,
            video_codec: codec,
            strict_codec: strict,
            ..Default::default()
        }
    }

    /// Collect events until the session stops or streams, whichever `until` selects
    async fn collect_until(
        rx: &mut broadcast::Receiver<SessionEvent>,
        until: fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                let done = until(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for session event");
        seen
    }

    fn is_streaming(e: &SessionEvent) -> bool {
        matches!(e, SessionEvent::Streaming { .. })
    }

    fn is_stopped(e: &SessionEvent) -> bool {
        matches!(e, SessionEvent::Stopped { .. })
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_reaches_streaming() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, true, AudioMode::Mic), h.grant())
            .await
            .unwrap();
        let events = collect_until(&mut rx, is_streaming).await;

        assert_eq!(
            states(&events),
            vec![
                SessionState::Starting,
                SessionState::Negotiating,
                SessionState::Streaming
            ]
        );
        assert_eq!(h.engine.state(), SessionState::Streaming);

        // Offer munged before the POST
        let offer = h.signaling.offers.lock()[0].clone();
        assert!(offer.contains("maxaveragebitrate=64000"));
        assert!(offer.contains("m=video 9 UDP/TLS/RTP/SAVPF 102 96"));
        assert!(h
            .journal
            .entries()
            .contains(&"signaling.post https://ingest.example/whip/abc123".to_string()));

        // Answer restricted to H264 before it is applied
        let remote = h.peer().remote.lock().clone().unwrap();
        assert!(!remote.contains("VP8"));

        // Authoritative limits on both senders
        let senders = h.peer().senders.lock().clone();
        let video = senders.iter().find(|s| s.kind == MediaKind::Video).unwrap();
        assert_eq!(video.encodings.lock()[0].max_bitrate_bps, Some(2_500_000));
        let audio = senders.iter().find(|s| s.kind == MediaKind::Audio).unwrap();
        assert_eq!(audio.encodings.lock()[0].max_bitrate_bps, Some(64_000));
    }

    #[tokio::test]
    async fn test_strict_codec_mismatch_stops_session() {
        let h = Harness::new(Ok(ANSWER_VP8_ONLY.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, true, AudioMode::None), h.grant())
            .await
            .unwrap();
        let events = collect_until(&mut rx, is_stopped).await;

        assert!(!events.iter().any(is_streaming));
        assert_eq!(
            states(&events),
            vec![
                SessionState::Starting,
                SessionState::Negotiating,
                SessionState::Stopping,
                SessionState::Stopped
            ]
        );
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Stopped {
                reason: StopReason::StrictCodecUnavailable,
                ..
            })
        ));
        assert_eq!(h.journal.count("peer.set_remote"), 0);
    }

    #[tokio::test]
    async fn test_lenient_codec_mismatch_keeps_remote_choice() {
        let h = Harness::new(Ok(ANSWER_VP8_ONLY.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;
        assert!(h.peer().remote.lock().clone().unwrap().contains("VP8"));
    }

    #[tokio::test]
    async fn test_system_audio_without_loopback_uses_microphone() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), false);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::System), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        assert_eq!(h.journal.count("mic.open"), 1);
        assert_eq!(h.journal.count("loopback.open"), 0);
    }

    #[tokio::test]
    async fn test_system_audio_shares_authorization() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::System), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        assert_eq!(h.journal.count("loopback.open"), 1);
        assert_eq!(h.journal.count("mic.open"), 0);
    }

    #[tokio::test]
    async fn test_double_stop_tears_down_once() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::Mic), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        h.engine.stop();
        h.engine.stop();
        let events = collect_until(&mut rx, is_stopped).await;
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Stopped {
                reason: StopReason::UserRequested,
                ..
            })
        ));

        // Let the second stop drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.journal.count("peer.close"), 1);
        assert_eq!(h.journal.count("grant.stop"), 1);
        assert_eq!(h.engine.state(), SessionState::Stopped);
        assert!(rx.try_recv().is_err());

        // Release order: bridge, sources, authorization, peer
        let order: Vec<String> = h
            .journal
            .entries()
            .into_iter()
            .filter(|e| ["display.release", "mic.close", "grant.stop", "peer.close"].contains(&e.as_str()))
            .collect();
        assert_eq!(order, vec!["display.release", "mic.close", "grant.stop", "peer.close"]);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        h.engine.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.state(), SessionState::Idle);
        assert!(h.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_remote_rejection() {
        let h = Harness::new(
            Err(SignalingError::RemoteRejected {
                status: 403,
                body: "bad key".to_string(),
            }),
            true,
        );
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        let events = collect_until(&mut rx, is_stopped).await;

        match events.last() {
            Some(SessionEvent::Stopped { reason, detail, .. }) => {
                assert_eq!(*reason, StopReason::RemoteRejected);
                assert!(detail.as_deref().unwrap_or_default().contains("403"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_answer_is_signaling_failure() {
        let h = Harness::new(Err(SignalingError::EmptyAnswer), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::VP8, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        let events = collect_until(&mut rx, is_stopped).await;
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Stopped {
                reason: StopReason::SignalingFailed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connection_failure_stops_session() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        h.peer().state.send_replace(ConnectionState::Failed);
        let events = collect_until(&mut rx, is_stopped).await;
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Stopped {
                reason: StopReason::ConnectionLost,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_capture_termination_stops_session() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        h.authorization.terminated.send_replace(true);
        let events = collect_until(&mut rx, is_stopped).await;
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Stopped {
                reason: StopReason::CaptureLost,
                ..
            })
        ));
        assert_eq!(h.journal.count("peer.close"), 1);
    }

    #[tokio::test]
    async fn test_stop_during_negotiation_discards_answer() {
        let h = Harness::with_delay(
            Ok(ANSWER_H264_VP8.to_string()),
            true,
            Duration::from_millis(100),
        );
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        h.engine.stop();
        collect_until(&mut rx, is_stopped).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.journal.count("peer.set_remote"), 0);
        assert_eq!(h.engine.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_params_fail_fast() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);

        let mut no_url = params(VideoCodec::H264, false, AudioMode::Mic);
        no_url.endpoint = "  ".to_string();
        let err = h.engine.start(no_url, h.grant()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        let err = h
            .engine
            .start(params(VideoCodec::H264, false, AudioMode::Mic), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        assert_eq!(h.engine.state(), SessionState::Stopped);
        assert!(h.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_replaces_session() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        let first = h
            .engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        let second = h
            .engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        assert_ne!(first, second);

        let events = collect_until(&mut rx, is_streaming).await;
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Stopped { session_id, .. } if *session_id == first
        )));
        assert_eq!(h.journal.count("peer.close"), 1);
        assert_eq!(h.engine.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_limits_enforced_at_each_negotiation_step() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        // After the tracks are added, after the local offer, after the answer
        assert_eq!(h.journal.count("sender.set video"), 3);
        let entries = h.journal.entries();
        let position = |entry: &str| entries.iter().position(|e| e == entry).unwrap();
        assert!(position("peer.add video") < position("sender.set video"));
        let last_set = entries.iter().rposition(|e| e == "sender.set video").unwrap();
        assert!(position("peer.set_remote") < last_set);
    }

    #[tokio::test]
    async fn test_enforcement_retried_until_senders_ready() {
        let h = Harness::with_enforcement(
            Ok(ANSWER_H264_VP8.to_string()),
            EnforcementSettings {
                max_attempts: 3,
                retry_delay_ms: 100,
            },
        );
        h.peers.encodings_per_sender.store(0, Ordering::SeqCst);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;

        let video = h.peer().senders.lock()[0].clone();
        assert!(video.encodings.lock().is_empty());
        assert_eq!(h.journal.count("sender.set video"), 0);

        // The engine populates encodings once transport is up
        video.encodings.lock().push(EncodingParameters::default());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(video.encodings.lock()[0].max_bitrate_bps, Some(2_500_000));
        assert_eq!(video.encodings.lock()[0].max_framerate, Some(30));
        assert_eq!(h.journal.count("sender.set video"), 1);
        assert_eq!(h.engine.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_enforcement_gives_up_after_max_attempts() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        h.peers.encodings_per_sender.store(0, Ordering::SeqCst);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        collect_until(&mut rx, is_streaming).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Two passes during negotiation, then three after the answer
        assert_eq!(h.journal.count("sender.read video"), 5);
        assert_eq!(h.journal.count("sender.set video"), 0);
        assert_eq!(h.engine.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_capture_terminated_before_start_stops_session() {
        let h = Harness::new(Ok(ANSWER_H264_VP8.to_string()), true);
        h.authorization.terminated.send_replace(true);
        let mut rx = h.engine.subscribe();

        h.engine
            .start(params(VideoCodec::H264, false, AudioMode::None), h.grant())
            .await
            .unwrap();
        let events = collect_until(&mut rx, is_stopped).await;

        assert!(matches!(
            events.last(),
            Some(SessionEvent::Stopped {
                reason: StopReason::CaptureLost,
                ..
            })
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.state(), SessionState::Stopped);
        assert_eq!(h.journal.count("display.release"), 1);
        assert_eq!(h.journal.count("peer.close"), 1);
    }
}
