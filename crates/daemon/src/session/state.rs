//! Session lifecycle types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::{DeviceFingerprint, DeviceId, ProtocolError, SessionCode, SessionFeatures};
use thiserror::Error;

use crate::authorization::Role;

/// Unique identifier for a session (UUID v4).
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session or code was not found.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session code failed format or checksum validation.
    #[error("invalid session code: {0}")]
    InvalidCode(#[from] ProtocolError),

    /// The session expired before the operation.
    #[error("session expired: {0}")]
    Expired(SessionId),

    /// The one-time session code has already been consumed.
    #[error("session code already used: {0}")]
    AlreadyUsed(SessionId),

    /// No room for another participant.
    #[error("session is full: at most {max} participants")]
    SessionFull { max: usize },

    /// The device is already part of the session.
    #[error("device already in session: {0}")]
    AlreadyParticipant(DeviceId),

    /// The device is not part of the session.
    #[error("device not in session: {0}")]
    NotParticipant(DeviceId),

    /// The operation is not valid in the session's current state.
    #[error("session {session_id} is {status}")]
    InvalidState {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// Joining devices cannot take the host role.
    #[error("session already has a host")]
    HostRoleTaken,

    /// The manager is at its session capacity.
    #[error("too many sessions: limit is {0}")]
    TooManySessions(usize),
}

/// Lifecycle state of a session.
///
/// ```text
/// Created -> PendingVerification -> Active -> Closing -> Terminated
///    |               |
///    +---------------+--> Expired
/// ```
///
/// Any non-terminal state may also move to `Terminated` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for a peer to join.
    Created,
    /// A peer joined; fingerprints not yet confirmed.
    PendingVerification,
    /// Verified and in use.
    Active,
    /// Being torn down.
    Closing,
    /// Ended by a participant, the host leaving, cleanup or shutdown.
    Terminated,
    /// The timer fired before verification.
    Expired,
}

impl SessionStatus {
    /// Whether the session has reached an end state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Expired)
    }

    /// Whether the expiration timer ends the session in this state.
    pub fn expires_on_timeout(&self) -> bool {
        matches!(
            self,
            SessionStatus::Created | SessionStatus::PendingVerification
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Created, PendingVerification) => true,
            (PendingVerification, Active) => true,
            (Active, Closing) => true,
            (Closing, Terminated) => true,
            (Created | PendingVerification, Expired) => true,
            (Created | PendingVerification | Active | Closing, Terminated) => true,
            (Created | PendingVerification, Closing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::PendingVerification => "pending_verification",
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A participant asked to end it.
    Requested,
    /// The host left.
    HostLeft,
    /// Nobody joined within the grace period.
    Abandoned,
    /// The daemon is shutting down.
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::Requested => "requested",
            EndReason::HostLeft => "host_left",
            EndReason::Abandoned => "abandoned",
            EndReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// A device taking part in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub device_id: DeviceId,
    pub fingerprint: DeviceFingerprint,
}

impl Participant {
    pub fn new(device_id: DeviceId, fingerprint: DeviceFingerprint) -> Self {
        Self {
            device_id,
            fingerprint,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Unique session identifier.
    pub id: SessionId,
    /// Pairing code.
    pub code: SessionCode,
    /// The creating device.
    pub host: Participant,
    /// Joined devices and their roles, host excluded.
    pub participants: Vec<(Participant, Role)>,
    /// Enabled features.
    pub features: SessionFeatures,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Whether fingerprints were confirmed.
    pub verified: bool,
    /// Whether the one-time code was consumed.
    pub code_used: bool,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
    /// Expiry, unix milliseconds.
    pub expires_at_ms: Option<u64>,
    /// Time since the last recorded activity.
    pub idle: Duration,
}

impl SessionSnapshot {
    /// Whether a device is the host or a joined participant.
    pub fn has_device(&self, device_id: &DeviceId) -> bool {
        self.host.device_id == *device_id
            || self.participants.iter().any(|(p, _)| p.device_id == *device_id)
    }

    /// Total number of devices, host included.
    pub fn device_count(&self) -> usize {
        1 + self.participants.len()
    }
}

/// Lifecycle notifications published by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created {
        session_id: SessionId,
    },
    ParticipantJoined {
        session_id: SessionId,
        device_id: DeviceId,
        role: Role,
    },
    ParticipantLeft {
        session_id: SessionId,
        device_id: DeviceId,
    },
    Verified {
        session_id: SessionId,
    },
    Ended {
        session_id: SessionId,
        reason: EndReason,
    },
    Expired {
        session_id: SessionId,
    },
}

impl SessionEvent {
    /// The session the event refers to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created { session_id }
            | SessionEvent::ParticipantJoined { session_id, .. }
            | SessionEvent::ParticipantLeft { session_id, .. }
            | SessionEvent::Verified { session_id }
            | SessionEvent::Ended { session_id, .. }
            | SessionEvent::Expired { session_id } => session_id,
        }
    }

    /// Whether the session no longer exists after this event.
    pub fn is_final(&self) -> bool {
        matches!(self, SessionEvent::Ended { .. } | SessionEvent::Expired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(PendingVerification));
        assert!(PendingVerification.can_transition_to(Active));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Terminated));
    }

    #[test]
    fn test_only_unverified_sessions_expire() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Expired));
        assert!(PendingVerification.can_transition_to(Expired));
        assert!(!Active.can_transition_to(Expired));
        assert!(!Closing.can_transition_to(Expired));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use SessionStatus::*;
        let all = [
            Created,
            PendingVerification,
            Active,
            Closing,
            Terminated,
            Expired,
        ];
        for from in [Terminated, Expired] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_backward_transitions() {
        use SessionStatus::*;
        assert!(!Active.can_transition_to(PendingVerification));
        assert!(!PendingVerification.can_transition_to(Created));
        assert!(!Active.can_transition_to(Created));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            SessionError::NotFound("abc".to_string()).to_string(),
            "session not found: abc"
        );
        assert_eq!(
            SessionError::SessionFull { max: 2 }.to_string(),
            "session is full: at most 2 participants"
        );
        assert_eq!(
            SessionError::InvalidState {
                session_id: "s1".to_string(),
                status: SessionStatus::Active
            }
            .to_string(),
            "session s1 is active"
        );
        assert_eq!(
            SessionError::InvalidCode(ProtocolError::ChecksumMismatch).to_string(),
            format!("invalid session code: {}", ProtocolError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionError>();
    }
}
