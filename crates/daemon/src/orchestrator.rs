//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and
//! coordinates the daemon subsystems: local identity, rate limiting,
//! authorization, session management, signaling and per-session routing.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tether_protocol::{establish_cipher, DeviceId, KeyExchange};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authorization::Authorizer;
use crate::config::Config;
use crate::identity::LocalIdentity;
use crate::ratelimit::RateLimiter;
use crate::router::{ConnectionRouter, Outbox, ParticipantEvent};
use crate::session::{
    EndReason, SessionError, SessionEvent, SessionId, SessionManager, SessionManagerImpl,
};
use crate::signaling::SignalingService;
use crate::transport::{BytePipe, SecureLink};

/// Queued participant notifications before routers wait.
const PARTICIPANT_EVENT_CAPACITY: usize = 64;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, spawning background tasks.
    Starting,
    /// Running and serving sessions.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A router was opened for a session.
    RouterOpened { session_id: SessionId },
    /// A session ended or expired and its router was dropped.
    SessionClosed { session_id: SessionId },
    /// A participant's connection went away.
    ParticipantDisconnected {
        session_id: SessionId,
        device_id: DeviceId,
    },
}

type Routers = Arc<DashMap<SessionId, Arc<ConnectionRouter>>>;

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Identity presented to peers.
    identity: LocalIdentity,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    authorizer: Arc<Authorizer>,
    session_manager: Arc<SessionManagerImpl>,
    rate_limiter: Arc<RateLimiter>,
    signaling: Arc<SignalingService>,
    /// Routers by session.
    routers: Routers,
    /// Handed to every router for disconnect notifications.
    participant_tx: mpsc::Sender<ParticipantEvent>,
    participant_rx: Option<mpsc::Receiver<ParticipantEvent>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let identity = LocalIdentity::load_or_generate(&config.daemon.data_dir)
            .context("Failed to load device identity")?;
        info!(
            device_id = %identity.device_id,
            fingerprint = %identity.fingerprint,
            "Daemon identity loaded"
        );

        let authorizer = Arc::new(Authorizer::new());
        let session_manager =
            SessionManagerImpl::new(config.session.clone(), Arc::clone(&authorizer));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let signaling = Arc::new(SignalingService::new(
            Arc::clone(&session_manager),
            Arc::clone(&rate_limiter),
        ));

        let (participant_tx, participant_rx) = mpsc::channel(PARTICIPANT_EVENT_CAPACITY);
        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            config,
            identity,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            authorizer,
            session_manager,
            rate_limiter,
            signaling,
            routers: Arc::new(DashMap::new()),
            participant_tx,
            participant_rx: Some(participant_rx),
            shutdown_token: CancellationToken::new(),
            event_tx,
            tasks: Vec::new(),
        })
    }

    /// Returns the local identity.
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        let Some(participant_rx) = self.participant_rx.take() else {
            *self.state.write().await = OrchestratorState::Stopped;
            anyhow::bail!("Orchestrator cannot be restarted");
        };

        info!("Starting daemon orchestrator...");

        self.tasks.push(self.session_manager.start_cleanup_task(
            self.config.session.cleanup_interval_secs,
            self.shutdown_token.clone(),
        ));
        debug!("Started session cleanup task");

        self.tasks.push(self.rate_limiter.start_cleanup_task(
            self.config.rate_limit.sweep_interval_secs,
            self.shutdown_token.clone(),
        ));
        debug!("Started rate limiter sweep task");

        let session_events = self.session_manager.subscribe();
        let session_manager = Arc::clone(&self.session_manager);
        let routers = Arc::clone(&self.routers);
        let event_tx = self.event_tx.clone();
        let shutdown_token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            Self::run_event_loop(
                participant_rx,
                session_events,
                session_manager,
                routers,
                event_tx,
                shutdown_token,
            )
            .await;
        }));

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Reacts to participant disconnects and session lifecycle events.
    async fn run_event_loop(
        mut participant_rx: mpsc::Receiver<ParticipantEvent>,
        mut session_events: broadcast::Receiver<SessionEvent>,
        session_manager: Arc<SessionManagerImpl>,
        routers: Routers,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Event loop shutting down");
                    break;
                }

                Some(event) = participant_rx.recv() => {
                    let ParticipantEvent::Disconnected { session_id, device_id } = event;
                    info!(session_id = %session_id, device_id = %device_id, "Participant disconnected");

                    let router = routers.get(&session_id).map(|r| Arc::clone(r.value()));
                    if let Some(router) = router {
                        router.remove_participant(&device_id).await;
                    }
                    match session_manager.remove_participant(&session_id, &device_id).await {
                        Ok(()) | Err(SessionError::NotFound(_)) | Err(SessionError::NotParticipant(_)) => {}
                        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to remove participant"),
                    }
                    let _ = event_tx.send(OrchestratorEvent::ParticipantDisconnected { session_id, device_id });
                }

                result = session_events.recv() => {
                    match result {
                        Ok(SessionEvent::ParticipantLeft { session_id, device_id }) => {
                            let router = routers.get(&session_id).map(|r| Arc::clone(r.value()));
                            if let Some(router) = router {
                                router.remove_participant(&device_id).await;
                            }
                        }
                        Ok(event) if event.is_final() => {
                            let session_id = event.session_id().clone();
                            if routers.remove(&session_id).is_some() {
                                debug!(session_id = %session_id, "Router dropped");
                            }
                            let _ = event_tx.send(OrchestratorEvent::SessionClosed { session_id });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Session events lagged, reconciling routers");
                            routers.retain(|id, _| session_manager.exists(id));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }

        let ended = self.session_manager.end_all(EndReason::Shutdown).await;
        self.routers.clear();
        debug!(ended, "Ended sessions");

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Returns the router for a session, creating it on first use.
    pub async fn open_router(&self, session_id: &SessionId) -> Result<Arc<ConnectionRouter>> {
        if self.state().await != OrchestratorState::Running {
            anyhow::bail!("Orchestrator is not running");
        }
        if !self.session_manager.exists(session_id) {
            return Err(SessionError::NotFound(session_id.clone()).into());
        }

        let mut created = false;
        let router = self
            .routers
            .entry(session_id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(ConnectionRouter::new(
                    session_id.clone(),
                    Arc::clone(&self.authorizer),
                    self.participant_tx.clone(),
                ))
            })
            .clone();

        if created {
            debug!(session_id = %session_id, "Router opened");
            self.emit_event(OrchestratorEvent::RouterOpened {
                session_id: session_id.clone(),
            });
        }
        Ok(router)
    }

    /// Registers a participant's outbox with its session's router.
    pub async fn connect_participant(
        &self,
        session_id: &SessionId,
        device_id: DeviceId,
        outbox: Outbox,
    ) -> Result<Arc<ConnectionRouter>> {
        let role = self
            .authorizer
            .role_of(session_id, &device_id)
            .ok_or_else(|| SessionError::NotParticipant(device_id.clone()))?;
        let router = self.open_router(session_id).await?;
        router.add_participant(device_id, role, outbox).await?;
        Ok(router)
    }

    /// Completes a key agreement with a peer and wraps `pipe` in a secure link.
    ///
    /// The session id salts the derivation so keys never carry over between
    /// sessions.
    pub fn establish_link<P: BytePipe>(
        &self,
        pipe: P,
        session_id: &SessionId,
        key_exchange: &KeyExchange,
        remote_public_key: &[u8],
    ) -> Result<SecureLink<P>> {
        let cipher = establish_cipher(
            key_exchange,
            remote_public_key,
            Some(session_id.as_bytes()),
            Some(self.config.crypto.kdf_context.as_bytes()),
            self.config.crypto.aead,
        )
        .context("Key agreement failed")?;
        debug!(session_id = %session_id, algorithm = ?self.config.crypto.aead, "Secure link established");
        Ok(SecureLink::new(
            pipe,
            cipher,
            session_id.clone(),
            self.identity.device_id.clone(),
        ))
    }

    /// Returns the router for a session, if one is open.
    pub fn router(&self, session_id: &SessionId) -> Option<Arc<ConnectionRouter>> {
        self.routers.get(session_id).map(|r| Arc::clone(r.value()))
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Returns the signaling service.
    pub fn signaling(&self) -> &Arc<SignalingService> {
        &self.signaling
    }

    /// Returns the rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Returns the authorizer.
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// Returns the number of open routers.
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::outbox;
    use crate::transport::memory_pipe_pair;
    use tether_protocol::messages::ClipboardData;
    use tether_protocol::AppEvent;
    use tempfile::TempDir;
    use tether_protocol::messages::KeyboardEvent;
    use tether_protocol::{SessionFeatures, SignalingRequest, SignalingResponse};

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<OrchestratorEvent>,
        pred: impl Fn(&OrchestratorEvent) -> bool,
    ) -> OrchestratorEvent {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    /// Creates, joins and verifies a session through signaling.
    async fn paired_session(orchestrator: &DaemonOrchestrator) -> SessionId {
        let host_fp = orchestrator.identity().fingerprint.to_hex();
        let guest_fp = tether_protocol::DeviceFingerprint::from_bytes([5; 32]).to_hex();
        let signaling = orchestrator.signaling();

        let SignalingResponse::SessionCreated {
            session_id,
            session_code,
            ..
        } = signaling
            .handle(
                "host",
                SignalingRequest::CreateSession {
                    device_id: orchestrator.identity().device_id.clone(),
                    device_fingerprint: host_fp,
                    timeout_secs: None,
                    features: SessionFeatures::default(),
                },
            )
            .await
        else {
            panic!("create failed");
        };
        signaling
            .handle(
                "guest",
                SignalingRequest::JoinSession {
                    session_code,
                    device_id: DeviceId::new("guest").unwrap(),
                    device_fingerprint: guest_fp.clone(),
                },
            )
            .await;
        signaling
            .handle(
                "host",
                SignalingRequest::VerifySession {
                    session_id: session_id.clone(),
                    device_id: orchestrator.identity().device_id.clone(),
                    device_fingerprint: guest_fp,
                },
            )
            .await;
        session_id
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.router_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let first = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let second = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        assert_eq!(
            first.identity().fingerprint,
            second.identity().fingerprint
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.session.max_participants = 0;
        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.start().await.is_err());

        paired_session(&orchestrator).await;
        assert_eq!(orchestrator.session_manager().count(), 1);

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.session_manager().count(), 0);

        assert_eq!(
            events.recv().await.unwrap(),
            OrchestratorEvent::StateChanged(OrchestratorState::Starting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            OrchestratorEvent::StateChanged(OrchestratorState::Running)
        );

        // Restarting is not supported
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_router_requires_running_and_session() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let missing = "missing".to_string();

        assert!(orchestrator.open_router(&missing).await.is_err());
        orchestrator.start().await.unwrap();
        assert!(orchestrator.open_router(&missing).await.is_err());

        let session_id = paired_session(&orchestrator).await;
        let first = orchestrator.open_router(&session_id).await.unwrap();
        let second = orchestrator.open_router(&session_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let (tx, _rx) = outbox();
        assert!(orchestrator
            .connect_participant(&session_id, DeviceId::new("stranger").unwrap(), tx)
            .await
            .is_err());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_removes_participant() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator.start().await.unwrap();
        let mut events = orchestrator.subscribe();

        let session_id = paired_session(&orchestrator).await;
        let host = orchestrator.identity().device_id.clone();
        let guest = DeviceId::new("guest").unwrap();

        let (host_tx, _host_rx) = outbox();
        let (guest_tx, guest_rx) = outbox();
        orchestrator
            .connect_participant(&session_id, host.clone(), host_tx)
            .await
            .unwrap();
        let router = orchestrator
            .connect_participant(&session_id, guest.clone(), guest_tx)
            .await
            .unwrap();

        drop(guest_rx);
        let delivered = router
            .route_keyboard_input(
                &host,
                KeyboardEvent {
                    key_code: 1,
                    modifiers: 0,
                    pressed: true,
                    timestamp_ms: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        let event = next_matching(&mut events, |e| {
            matches!(e, OrchestratorEvent::ParticipantDisconnected { .. })
        })
        .await;
        assert_eq!(
            event,
            OrchestratorEvent::ParticipantDisconnected {
                session_id: session_id.clone(),
                device_id: guest.clone()
            }
        );

        let snapshot = orchestrator
            .session_manager()
            .get(&session_id)
            .await
            .unwrap();
        assert!(!snapshot.has_device(&guest));
        assert!(!router.has_participant(&guest).await);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_establish_link_matches_peer_derivation() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let kdf_context = config.crypto.kdf_context.clone();
        let algorithm = config.crypto.aead;
        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        let session_id: SessionId = "session-1".to_string();

        let local = KeyExchange::new();
        let remote = KeyExchange::new();
        let (local_pipe, remote_pipe) = memory_pipe_pair(8);

        let mut link = orchestrator
            .establish_link(local_pipe, &session_id, &local, &remote.public_key())
            .unwrap();
        let remote_cipher = establish_cipher(
            &remote,
            &local.public_key(),
            Some(session_id.as_bytes()),
            Some(kdf_context.as_bytes()),
            algorithm,
        )
        .unwrap();
        let mut peer = SecureLink::new(
            remote_pipe,
            remote_cipher,
            session_id.clone(),
            DeviceId::new("peer").unwrap(),
        );

        let event = AppEvent::Clipboard(ClipboardData {
            mime_type: "text/plain".to_string(),
            data: b"hello".to_vec(),
        });
        link.send_event(event.clone()).await.unwrap();
        let envelope = peer.recv_event().await.unwrap().unwrap();
        assert_eq!(envelope.payload, event);
        assert_eq!(&envelope.source, &orchestrator.identity().device_id);

        // A low-order point is rejected
        assert!(orchestrator
            .establish_link(memory_pipe_pair(1).0, &session_id, &local, &[0u8; 32])
            .is_err());
    }

    #[tokio::test]
    async fn test_ended_session_drops_router() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        orchestrator.start().await.unwrap();
        let mut events = orchestrator.subscribe();

        let session_id = paired_session(&orchestrator).await;
        orchestrator.open_router(&session_id).await.unwrap();
        assert_eq!(orchestrator.router_count(), 1);

        orchestrator
            .session_manager()
            .end_session(&session_id, EndReason::Requested)
            .await;

        next_matching(&mut events, |e| {
            matches!(e, OrchestratorEvent::SessionClosed { .. })
        })
        .await;
        assert!(orchestrator.router(&session_id).is_none());

        orchestrator.stop().await.unwrap();
    }
}
