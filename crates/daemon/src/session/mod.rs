//! Session management module.
//!
//! This module provides the pairing session lifecycle: creation with a
//! session code, joining, fingerprint verification, expiration and cleanup.

pub mod manager;
pub mod state;

pub use manager::{SessionManager, SessionManagerImpl};
pub use state::{
    EndReason, Participant, SessionError, SessionEvent, SessionId, SessionSnapshot, SessionStatus,
};
