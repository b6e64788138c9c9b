//! Session manager for pairing sessions.
//!
//! This module provides a thread-safe session manager that creates sessions,
//! admits participants by code, confirms fingerprints and expires or removes
//! sessions. Each session lives behind its own lock, so operations on
//! different sessions never contend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_protocol::{DeviceId, SessionCode, SessionFeatures};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::{
    EndReason, Participant, SessionError, SessionEvent, SessionId, SessionSnapshot, SessionStatus,
};
use crate::authorization::{Authorizer, Role};
use crate::config::SessionConfig;

/// Buffered lifecycle events per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Trait for session management operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a session hosted by `creator`.
    ///
    /// `timeout` overrides the configured default; the session expires if it
    /// is not verified in time.
    async fn create_session(
        &self,
        creator: Participant,
        timeout: Option<Duration>,
        features: SessionFeatures,
    ) -> Result<SessionSnapshot, SessionError>;

    /// Looks up a session by its code and checks that it can be joined.
    async fn join_session(&self, code: &str) -> Result<SessionSnapshot, SessionError>;

    /// Adds a joining device to a session.
    async fn attach_participant(
        &self,
        session_id: &SessionId,
        participant: Participant,
        role: Role,
    ) -> Result<SessionSnapshot, SessionError>;

    /// Confirms a joined device's fingerprint.
    ///
    /// Returns `Ok(false)` when the fingerprint matches no participant.
    async fn verify_session(
        &self,
        session_id: &SessionId,
        remote_fingerprint: &str,
    ) -> Result<bool, SessionError>;

    /// Ends a session. Returns false if it was already gone.
    async fn end_session(&self, session_id: &SessionId, reason: EndReason) -> bool;

    /// Removes a participant. Removing the host ends the session.
    async fn remove_participant(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> Result<(), SessionError>;

    /// Replaces a session's feature flags.
    async fn set_features(
        &self,
        session_id: &SessionId,
        features: SessionFeatures,
    ) -> Result<(), SessionError>;

    /// Records activity from a participant.
    async fn heartbeat(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> Result<SessionStatus, SessionError>;

    /// Removes expired and abandoned sessions. Returns how many were removed.
    async fn cleanup_sessions(&self) -> usize;

    /// Gets a snapshot of a specific session.
    async fn get(&self, session_id: &SessionId) -> Option<SessionSnapshot>;

    /// Lists the ids of all live sessions.
    fn list(&self) -> Vec<SessionId>;

    /// Checks if a session exists.
    fn exists(&self, session_id: &SessionId) -> bool;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

struct SessionRecord {
    id: SessionId,
    code: SessionCode,
    host: Participant,
    participants: Vec<(Participant, Role)>,
    features: SessionFeatures,
    status: SessionStatus,
    verified: bool,
    code_used: bool,
    /// Set when the timer fires on an active session.
    code_expired: bool,
    created_at: Instant,
    created_at_ms: u64,
    deadline: Option<Instant>,
    expires_at_ms: Option<u64>,
    last_activity: Instant,
    timer: Option<JoinHandle<()>>,
}

impl SessionRecord {
    fn has_device(&self, device_id: &DeviceId) -> bool {
        self.host.device_id == *device_id
            || self.participants.iter().any(|(p, _)| p.device_id == *device_id)
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            code: self.code.clone(),
            host: self.host.clone(),
            participants: self.participants.clone(),
            features: self.features,
            status: self.status,
            verified: self.verified,
            code_used: self.code_used,
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms,
            idle: self.last_activity.elapsed(),
        }
    }
}

/// Thread-safe session manager implementation using DashMap.
pub struct SessionManagerImpl {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Mutex<SessionRecord>>>,
    /// Map of canonical code to session ID.
    codes: DashMap<String, SessionId>,
    /// Slots taken against `max_sessions`, reserved before insertion.
    slots: AtomicUsize,
    authorizer: Arc<Authorizer>,
    config: SessionConfig,
    events: broadcast::Sender<SessionEvent>,
    /// Handle given to expiration timers; they must not keep the manager alive.
    this: Weak<Self>,
}

impl SessionManagerImpl {
    /// Creates a new session manager.
    pub fn new(config: SessionConfig, authorizer: Arc<Authorizer>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            sessions: DashMap::new(),
            codes: DashMap::new(),
            slots: AtomicUsize::new(0),
            authorizer,
            config,
            events,
            this: this.clone(),
        })
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The authorizer this manager keeps in sync.
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// Session settings in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Ends every live session. Returns how many were ended.
    pub async fn end_all(&self, reason: EndReason) -> usize {
        let mut ended = 0;
        for id in self.list() {
            if self.end_session(&id, reason).await {
                ended += 1;
            }
        }
        ended
    }

    /// Starts a background task that periodically runs
    /// [`SessionManager::cleanup_sessions`] until `cancel` fires.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval_secs: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.cleanup_sessions().await;
                    }
                }
            }
            tracing::debug!("Session cleanup task stopped");
        })
    }

    fn record(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionRecord>>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn spawn_expiry_timer(&self, session_id: SessionId, deadline: Instant) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(manager) = this.upgrade() {
                manager.on_timer_fired(&session_id).await;
            }
        })
    }

    async fn on_timer_fired(&self, session_id: &SessionId) {
        let Some(record) = self.record(session_id) else {
            return;
        };
        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return;
        }
        // This task is the timer; dropping its handle just detaches it
        record.timer = None;
        self.expire_if_due(&mut record);
    }

    /// Applies an elapsed deadline. Returns true if the session was expired.
    ///
    /// Unverified sessions expire; active sessions only lose their code.
    fn expire_if_due(&self, record: &mut SessionRecord) -> bool {
        if !record.deadline_passed(Instant::now()) {
            return false;
        }
        if record.status.expires_on_timeout() {
            self.retire(record, SessionStatus::Expired);
            tracing::info!(session_id = %record.id, "Session expired");
            self.emit(SessionEvent::Expired {
                session_id: record.id.clone(),
            });
            true
        } else {
            if !record.code_expired {
                record.code_expired = true;
                tracing::debug!(session_id = %record.id, "Session code expired");
            }
            false
        }
    }

    /// Moves a record to a terminal state and removes every trace of it.
    ///
    /// Must be called with the record's lock held. The status is set first so
    /// that callers queued on the same lock observe the terminal state.
    fn retire(&self, record: &mut SessionRecord, status: SessionStatus) {
        record.status = status;
        if let Some(timer) = record.timer.take() {
            timer.abort();
        }
        let id = record.id.clone();
        self.codes.remove_if(record.code.as_str(), |_, owner| *owner == id);
        if self.sessions.remove(&id).is_some() {
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
        self.authorizer.remove_session(&id);
    }

    fn close(&self, record: &mut SessionRecord, reason: EndReason) {
        record.status = SessionStatus::Closing;
        self.retire(record, SessionStatus::Terminated);
        tracing::info!(session_id = %record.id, reason = %reason, "Session ended");
        self.emit(SessionEvent::Ended {
            session_id: record.id.clone(),
            reason,
        });
    }

    /// Checks that a live record still admits new participants.
    fn check_joinable(&self, record: &mut SessionRecord) -> Result<(), SessionError> {
        if self.expire_if_due(record) || record.code_expired {
            return Err(SessionError::Expired(record.id.clone()));
        }
        if self.config.one_time_use && record.code_used {
            return Err(SessionError::AlreadyUsed(record.id.clone()));
        }
        match record.status {
            SessionStatus::Created | SessionStatus::PendingVerification => Ok(()),
            SessionStatus::Active if !self.config.one_time_use => Ok(()),
            status => Err(SessionError::InvalidState {
                session_id: record.id.clone(),
                status,
            }),
        }
    }
}

impl SessionManager for SessionManagerImpl {
    async fn create_session(
        &self,
        creator: Participant,
        timeout: Option<Duration>,
        features: SessionFeatures,
    ) -> Result<SessionSnapshot, SessionError> {
        let max = self.config.max_sessions;
        if self
            .slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            return Err(SessionError::TooManySessions(max));
        }

        let id = Uuid::new_v4().to_string();
        let code = loop {
            let candidate = SessionCode::generate();
            match self.codes.entry(candidate.as_str().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(id.clone());
                    break candidate;
                }
                Entry::Occupied(_) => {
                    tracing::debug!("Session code collision, regenerating");
                }
            }
        };

        let now = Instant::now();
        let created_at_ms = unix_millis();
        let timeout = timeout.or_else(|| self.config.default_timeout());
        let deadline = timeout.map(|t| now + t);
        let timer = deadline.map(|d| self.spawn_expiry_timer(id.clone(), d));

        let record = SessionRecord {
            id: id.clone(),
            code,
            host: creator,
            participants: Vec::new(),
            features,
            status: SessionStatus::Created,
            verified: false,
            code_used: false,
            code_expired: false,
            created_at: now,
            created_at_ms,
            deadline,
            expires_at_ms: timeout.map(|t| created_at_ms.saturating_add(t.as_millis() as u64)),
            last_activity: now,
            timer,
        };
        let snapshot = record.snapshot();

        self.authorizer.register_session(
            &id,
            &record.host.device_id,
            features,
            self.config.require_verification,
        );
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(record)));

        tracing::info!(
            session_id = %id,
            host = %snapshot.host.device_id,
            timeout_secs = timeout.map(|t| t.as_secs()),
            "Session created"
        );
        self.emit(SessionEvent::Created { session_id: id });

        Ok(snapshot)
    }

    async fn join_session(&self, code: &str) -> Result<SessionSnapshot, SessionError> {
        let code = SessionCode::parse(code)?;
        let session_id = self
            .codes
            .get(code.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(code.to_display()))?;
        let record = self
            .record(&session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return Err(SessionError::NotFound(session_id));
        }
        self.check_joinable(&mut record)?;
        Ok(record.snapshot())
    }

    async fn attach_participant(
        &self,
        session_id: &SessionId,
        participant: Participant,
        role: Role,
    ) -> Result<SessionSnapshot, SessionError> {
        if role == Role::Host {
            return Err(SessionError::HostRoleTaken);
        }
        let record = self
            .record(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return Err(SessionError::NotFound(session_id.clone()));
        }
        self.check_joinable(&mut record)?;

        if record.has_device(&participant.device_id) {
            return Err(SessionError::AlreadyParticipant(participant.device_id));
        }
        if 1 + record.participants.len() >= self.config.max_participants {
            return Err(SessionError::SessionFull {
                max: self.config.max_participants,
            });
        }

        let device_id = participant.device_id.clone();
        record.participants.push((participant, role));
        if record.status == SessionStatus::Created {
            record.status = SessionStatus::PendingVerification;
        }
        record.last_activity = Instant::now();
        self.authorizer.add_participant(session_id, &device_id, role);

        tracing::info!(
            session_id = %session_id,
            device_id = %device_id,
            role = %role,
            "Participant joined"
        );
        self.emit(SessionEvent::ParticipantJoined {
            session_id: session_id.clone(),
            device_id,
            role,
        });

        Ok(record.snapshot())
    }

    async fn verify_session(
        &self,
        session_id: &SessionId,
        remote_fingerprint: &str,
    ) -> Result<bool, SessionError> {
        let record = self
            .record(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return Err(SessionError::NotFound(session_id.clone()));
        }
        if self.expire_if_due(&mut record) {
            return Err(SessionError::Expired(session_id.clone()));
        }
        if self.config.one_time_use && record.code_used {
            return Err(SessionError::AlreadyUsed(session_id.clone()));
        }
        if !matches!(
            record.status,
            SessionStatus::PendingVerification | SessionStatus::Active
        ) {
            return Ok(false);
        }

        let matched = record
            .participants
            .iter()
            .any(|(p, _)| p.fingerprint.matches_prefix(remote_fingerprint));
        if !matched {
            tracing::warn!(session_id = %session_id, "Fingerprint verification failed");
            return Ok(false);
        }

        record.verified = true;
        record.status = SessionStatus::Active;
        if self.config.one_time_use {
            record.code_used = true;
        }
        record.last_activity = Instant::now();
        self.authorizer.set_verified(session_id, true);

        tracing::info!(session_id = %session_id, "Session verified");
        self.emit(SessionEvent::Verified {
            session_id: session_id.clone(),
        });

        Ok(true)
    }

    async fn end_session(&self, session_id: &SessionId, reason: EndReason) -> bool {
        let Some(record) = self.record(session_id) else {
            return false;
        };
        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return false;
        }
        self.close(&mut record, reason);
        true
    }

    async fn remove_participant(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> Result<(), SessionError> {
        let record = self
            .record(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return Err(SessionError::NotFound(session_id.clone()));
        }

        if record.host.device_id == *device_id {
            self.close(&mut record, EndReason::HostLeft);
            return Ok(());
        }

        let before = record.participants.len();
        record.participants.retain(|(p, _)| p.device_id != *device_id);
        if record.participants.len() == before {
            return Err(SessionError::NotParticipant(device_id.clone()));
        }
        self.authorizer.remove_participant(session_id, device_id);

        tracing::info!(session_id = %session_id, device_id = %device_id, "Participant left");
        self.emit(SessionEvent::ParticipantLeft {
            session_id: session_id.clone(),
            device_id: device_id.clone(),
        });
        Ok(())
    }

    async fn set_features(
        &self,
        session_id: &SessionId,
        features: SessionFeatures,
    ) -> Result<(), SessionError> {
        let record = self
            .record(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return Err(SessionError::NotFound(session_id.clone()));
        }
        record.features = features;
        self.authorizer.set_features(session_id, features);

        tracing::debug!(
            session_id = %session_id,
            clipboard_sync = features.clipboard_sync,
            screen_sharing = features.screen_sharing,
            "Session features updated"
        );
        Ok(())
    }

    async fn heartbeat(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
    ) -> Result<SessionStatus, SessionError> {
        let record = self
            .record(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let mut record = record.lock().await;
        if record.status.is_terminal() {
            return Err(SessionError::NotFound(session_id.clone()));
        }
        if !record.has_device(device_id) {
            return Err(SessionError::NotParticipant(device_id.clone()));
        }
        record.last_activity = Instant::now();
        Ok(record.status)
    }

    async fn cleanup_sessions(&self) -> usize {
        // Collect handles first; no map guard may be held across an await
        let records: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let grace = self.config.abandoned_grace();
        let mut removed = 0;
        for record in records {
            let mut record = record.lock().await;
            if record.status.is_terminal() {
                continue;
            }
            if self.expire_if_due(&mut record) {
                removed += 1;
                continue;
            }
            if record.status == SessionStatus::Created && record.created_at.elapsed() >= grace {
                self.close(&mut record, EndReason::Abandoned);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "Cleaned up sessions");
        }
        removed
    }

    async fn get(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let record = self.record(session_id)?;
        let record = record.lock().await;
        (!record.status.is_terminal()).then(|| record.snapshot())
    }

    fn list(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn exists(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
