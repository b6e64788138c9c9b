//! Connection router for application events inside a session.
//!
//! This module provides the `ConnectionRouter` that delivers input, clipboard
//! and screen events from one participant to the others. Every delivery is
//! checked against the [`Authorizer`]; participants receive events through a
//! bounded outbox and are reported as disconnected when it closes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tether_protocol::messages::{ClipboardData, KeyboardEvent, MouseEvent, ScreenFrame};
use tether_protocol::{AppEvent, DeviceId};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::authorization::{Authorizer, Decision, DenialReason, Operation, Role};
use crate::session::SessionId;

/// Events buffered per participant before deliveries start to wait.
pub const OUTBOX_CAPACITY: usize = 256;

/// How long a delivery may wait on a full outbox before it is dropped.
const SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Result type for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors that can occur during routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The authorizer refused the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(DenialReason),

    /// The device is not registered with this router.
    #[error("unknown participant: {0}")]
    UnknownParticipant(DeviceId),

    /// The device is already registered with this router.
    #[error("participant already registered: {0}")]
    DuplicateParticipant(DeviceId),

    /// Screen sharing was started without configured destinations.
    #[error("screen sharing not configured for {0}")]
    ScreenSharingNotConfigured(DeviceId),
}

/// An event on its way to one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Originating device.
    pub source: DeviceId,
    /// The event itself.
    pub event: AppEvent,
}

/// Sending half of a participant's outbox.
pub type Outbox = mpsc::Sender<Arc<Delivery>>;

/// Creates an outbox and its receiving half.
pub fn outbox() -> (Outbox, mpsc::Receiver<Arc<Delivery>>) {
    mpsc::channel(OUTBOX_CAPACITY)
}

/// Notifications posted by routers to their owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    /// A participant's outbox was closed.
    Disconnected {
        session_id: SessionId,
        device_id: DeviceId,
    },
}

struct Route {
    role: Role,
    outbox: Outbox,
}

/// Per-session router.
pub struct ConnectionRouter {
    session_id: SessionId,
    authorizer: Arc<Authorizer>,
    participants: RwLock<HashMap<DeviceId, Route>>,
    /// Configured screen destinations per source.
    screen_destinations: RwLock<HashMap<DeviceId, HashSet<DeviceId>>>,
    /// Sources currently sharing.
    screen_active: RwLock<HashSet<DeviceId>>,
    notifications: mpsc::Sender<ParticipantEvent>,
}

impl ConnectionRouter {
    /// Creates a router for `session_id` that reports disconnects on
    /// `notifications`.
    pub fn new(
        session_id: SessionId,
        authorizer: Arc<Authorizer>,
        notifications: mpsc::Sender<ParticipantEvent>,
    ) -> Self {
        Self {
            session_id,
            authorizer,
            participants: RwLock::new(HashMap::new()),
            screen_destinations: RwLock::new(HashMap::new()),
            screen_active: RwLock::new(HashSet::new()),
            notifications,
        }
    }

    /// The session this router serves.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Registers a participant and its outbox.
    pub async fn add_participant(
        &self,
        device_id: DeviceId,
        role: Role,
        outbox: Outbox,
    ) -> RouterResult<()> {
        let mut participants = self.participants.write().await;
        if participants.contains_key(&device_id) {
            return Err(RouterError::DuplicateParticipant(device_id));
        }
        debug!(session_id = %self.session_id, device_id = %device_id, role = %role, "Route added");
        participants.insert(device_id, Route { role, outbox });
        Ok(())
    }

    /// Unregisters a participant and purges it from screen sharing.
    /// Returns false if it was not registered.
    pub async fn remove_participant(&self, device_id: &DeviceId) -> bool {
        let removed = self.participants.write().await.remove(device_id).is_some();

        let mut destinations = self.screen_destinations.write().await;
        destinations.remove(device_id);
        for targets in destinations.values_mut() {
            targets.remove(device_id);
        }
        drop(destinations);
        self.screen_active.write().await.remove(device_id);

        if removed {
            debug!(session_id = %self.session_id, device_id = %device_id, "Route removed");
        }
        removed
    }

    /// Whether a device is registered.
    pub async fn has_participant(&self, device_id: &DeviceId) -> bool {
        self.participants.read().await.contains_key(device_id)
    }

    /// Number of registered participants.
    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Screen destinations configured for `source`.
    pub async fn screen_destinations(&self, source: &DeviceId) -> HashSet<DeviceId> {
        self.screen_destinations
            .read()
            .await
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    fn check(
        &self,
        device_id: &DeviceId,
        operation: Operation,
        resource: Option<&DeviceId>,
    ) -> RouterResult<()> {
        match self
            .authorizer
            .authorize(&self.session_id, device_id, operation, resource)
        {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => {
                warn!(
                    session_id = %self.session_id,
                    device_id = %device_id,
                    operation = %operation,
                    reason = %reason,
                    "Routing denied"
                );
                Err(RouterError::Unauthorized(reason))
            }
        }
    }

    async fn role_of(&self, device_id: &DeviceId) -> RouterResult<Role> {
        self.participants
            .read()
            .await
            .get(device_id)
            .map(|route| route.role)
            .ok_or_else(|| RouterError::UnknownParticipant(device_id.clone()))
    }

    /// Outboxes of every participant other than `source` that `filter` accepts.
    async fn targets(
        &self,
        source: &DeviceId,
        filter: impl Fn(&DeviceId, Role) -> bool,
    ) -> Vec<(DeviceId, Outbox)> {
        self.participants
            .read()
            .await
            .iter()
            .filter(|&(id, route)| id != source && filter(id, route.role))
            .map(|(id, route)| (id.clone(), route.outbox.clone()))
            .collect()
    }

    /// Sends `event` to every target concurrently. Returns how many accepted it.
    async fn fan_out(
        &self,
        source: &DeviceId,
        event: AppEvent,
        targets: Vec<(DeviceId, Outbox)>,
    ) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let delivery = Arc::new(Delivery {
            session_id: self.session_id.clone(),
            source: source.clone(),
            event,
        });

        let sends = targets.into_iter().map(|(device_id, outbox)| {
            let delivery = Arc::clone(&delivery);
            async move {
                let result = tokio::time::timeout(SEND_TIMEOUT, outbox.send(delivery)).await;
                (device_id, result)
            }
        });

        let mut delivered = 0;
        for (device_id, result) in join_all(sends).await {
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(_)) => {
                    debug!(session_id = %self.session_id, device_id = %device_id, "Outbox closed");
                    self.report_disconnect(device_id).await;
                }
                Err(_) => {
                    warn!(
                        session_id = %self.session_id,
                        device_id = %device_id,
                        "Outbox full, event dropped"
                    );
                }
            }
        }
        delivered
    }

    async fn report_disconnect(&self, device_id: DeviceId) {
        let event = ParticipantEvent::Disconnected {
            session_id: self.session_id.clone(),
            device_id,
        };
        if self.notifications.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "Disconnect listener gone");
        }
    }

    async fn route_input(
        &self,
        source: &DeviceId,
        operation: Operation,
        event: AppEvent,
    ) -> RouterResult<usize> {
        self.role_of(source).await?;
        self.check(source, operation, None)?;

        let targets = self
            .targets(source, |id, role| {
                role != Role::Host
                    && self
                        .authorizer
                        .authorize(&self.session_id, source, operation, Some(id))
                        .is_allowed()
            })
            .await;
        Ok(self.fan_out(source, event, targets).await)
    }

    /// Delivers a key event from the host to every other participant.
    pub async fn route_keyboard_input(
        &self,
        source: &DeviceId,
        event: KeyboardEvent,
    ) -> RouterResult<usize> {
        self.route_input(source, Operation::KeyboardInput, AppEvent::Keyboard(event))
            .await
    }

    /// Delivers a pointer event from the host to every other participant.
    pub async fn route_mouse_input(
        &self,
        source: &DeviceId,
        event: MouseEvent,
    ) -> RouterResult<usize> {
        self.route_input(source, Operation::MouseInput, AppEvent::Mouse(event))
            .await
    }

    /// Delivers clipboard contents.
    ///
    /// The host's clipboard goes to every participant allowed to receive it;
    /// anyone else's goes to the host only.
    pub async fn route_clipboard(
        &self,
        source: &DeviceId,
        data: ClipboardData,
    ) -> RouterResult<usize> {
        let source_role = self.role_of(source).await?;
        self.check(source, Operation::ClipboardSend, None)?;

        let targets = self
            .targets(source, |id, role| {
                (source_role == Role::Host || role == Role::Host)
                    && self
                        .authorizer
                        .authorize(&self.session_id, id, Operation::ClipboardReceive, None)
                        .is_allowed()
            })
            .await;
        Ok(self.fan_out(source, AppEvent::Clipboard(data), targets).await)
    }

    /// Sets the devices that receive `source`'s screen.
    pub async fn configure_screen_sharing(
        &self,
        source: &DeviceId,
        destinations: impl IntoIterator<Item = DeviceId>,
    ) -> RouterResult<()> {
        self.role_of(source).await?;
        self.check(source, Operation::ScreenShare, None)?;

        let mut targets = HashSet::new();
        {
            let participants = self.participants.read().await;
            for device_id in destinations {
                if !participants.contains_key(&device_id) {
                    return Err(RouterError::UnknownParticipant(device_id));
                }
                if device_id != *source {
                    targets.insert(device_id);
                }
            }
        }

        debug!(
            session_id = %self.session_id,
            source = %source,
            destinations = targets.len(),
            "Screen destinations configured"
        );
        self.screen_destinations
            .write()
            .await
            .insert(source.clone(), targets);
        Ok(())
    }

    /// Starts forwarding `source`'s screen frames to its configured
    /// destinations.
    pub async fn start_screen_sharing(&self, source: &DeviceId) -> RouterResult<()> {
        self.check(source, Operation::ScreenShare, None)?;
        if !self.screen_destinations.read().await.contains_key(source) {
            return Err(RouterError::ScreenSharingNotConfigured(source.clone()));
        }
        self.screen_active.write().await.insert(source.clone());
        debug!(session_id = %self.session_id, source = %source, "Screen sharing started");
        Ok(())
    }

    /// Stops screen sharing and forgets the destinations. Returns false if
    /// `source` was not sharing.
    pub async fn stop_screen_sharing(&self, source: &DeviceId) -> bool {
        let was_active = self.screen_active.write().await.remove(source);
        self.screen_destinations.write().await.remove(source);
        if was_active {
            debug!(session_id = %self.session_id, source = %source, "Screen sharing stopped");
        }
        was_active
    }

    /// Delivers a screen frame to the configured destinations.
    ///
    /// A source that is not sharing delivers nothing.
    pub async fn route_screen_data(
        &self,
        source: &DeviceId,
        frame: ScreenFrame,
    ) -> RouterResult<usize> {
        if !self.screen_active.read().await.contains(source) {
            return Ok(0);
        }
        let destinations = self.screen_destinations(source).await;
        if destinations.is_empty() {
            return Ok(0);
        }
        self.check(source, Operation::ScreenShare, None)?;

        let targets = self
            .targets(source, |id, _| {
                destinations.contains(id)
                    && self
                        .authorizer
                        .authorize(&self.session_id, id, Operation::ScreenView, None)
                        .is_allowed()
            })
            .await;
        Ok(self
            .fan_out(source, AppEvent::ScreenFrame(frame), targets)
            .await)
    }
}
