//! Message definitions for Tether.
//!
//! Two families of messages live here:
//!
//! - **Signaling** messages ([`SignalingRequest`], [`SignalingResponse`]) are
//!   exchanged as JSON with the signaling endpoint while a session is being
//!   created, joined and verified.
//! - **Application** events ([`AppEvent`]) flow between paired devices once a
//!   session is active. They are wrapped in an [`Envelope`], encoded with
//!   MessagePack and sealed by the AEAD layer before reaching the transport.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fingerprint::DeviceId;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

// ============================================================================
// Signaling Messages
// ============================================================================

/// Optional capabilities a session creator enables for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFeatures {
    /// Allow non-host participants to push clipboard contents to the host.
    pub clipboard_sync: bool,
    /// Allow screen sharing between participants.
    pub screen_sharing: bool,
}

/// Requests accepted by the signaling endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingRequest {
    /// Create a new session; the sender becomes its host.
    CreateSession {
        /// Announcing device.
        device_id: DeviceId,
        /// Hex fingerprint of the announcing device.
        device_fingerprint: String,
        /// Overrides the configured session timeout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        /// Features to enable at creation.
        #[serde(default)]
        features: SessionFeatures,
    },
    /// Join an existing session with its code.
    JoinSession {
        /// Code as typed by the user, separators allowed.
        session_code: String,
        /// Joining device.
        device_id: DeviceId,
        /// Hex fingerprint of the joining device.
        device_fingerprint: String,
    },
    /// Host confirms the joiner's fingerprint after out-of-band comparison.
    VerifySession {
        /// Session to verify.
        session_id: String,
        /// Requesting device, must be the host.
        device_id: DeviceId,
        /// Fingerprint (or at least a 12-character prefix) read off the peer.
        device_fingerprint: String,
    },
    /// Keep a session alive.
    Heartbeat {
        /// Session to refresh.
        session_id: String,
        /// Sending device.
        device_id: DeviceId,
    },
    /// Leave or close a session.
    EndSession {
        /// Session to end.
        session_id: String,
        /// Requesting device.
        device_id: DeviceId,
    },
}

impl SignalingRequest {
    /// Short operation name, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingRequest::CreateSession { .. } => "create_session",
            SignalingRequest::JoinSession { .. } => "join_session",
            SignalingRequest::VerifySession { .. } => "verify_session",
            SignalingRequest::Heartbeat { .. } => "heartbeat",
            SignalingRequest::EndSession { .. } => "end_session",
        }
    }

    /// Serialize the request to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a request from JSON.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Responses produced by the signaling endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingResponse {
    /// A session was created.
    SessionCreated {
        /// Session identifier.
        session_id: String,
        /// Canonical 9-symbol code to share with the peer.
        session_code: String,
        /// Expiry as unix milliseconds, if the session expires.
        expires_at: Option<u64>,
    },
    /// The sender joined a session.
    SessionJoined {
        /// Session identifier.
        session_id: String,
        /// Host device.
        host_device_id: DeviceId,
        /// Host fingerprint, for the joiner to compare out of band.
        host_fingerprint: String,
        /// Features enabled on the session.
        features: SessionFeatures,
        /// Expiry as unix milliseconds, if the session expires.
        expires_at: Option<u64>,
    },
    /// Outcome of a verification attempt.
    SessionVerified {
        /// Session identifier.
        session_id: String,
        /// Whether the fingerprint matched a participant.
        verified: bool,
    },
    /// Heartbeat acknowledged.
    HeartbeatAck {
        /// Session identifier.
        session_id: String,
        /// Current lifecycle state.
        status: String,
    },
    /// The session was ended.
    SessionEnded {
        /// Session identifier.
        session_id: String,
    },
    /// The request failed.
    Error(ErrorMessage),
}

impl SignalingResponse {
    /// Serialize the response to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a response from JSON.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// When rate limited or blocked, how long to wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Authorization failure.
    Unauthorized,
    /// Session or code not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Session code failed format or checksum validation.
    InvalidCode,
    /// Session expired.
    Expired,
    /// One-time session code already consumed.
    AlreadyUsed,
    /// Session has no room for another participant.
    SessionFull,
    /// Too many attempts in the current window.
    RateLimited,
    /// Client is temporarily blocked.
    Blocked,
    /// Server-side error.
    InternalError,
}

// ============================================================================
// Application Events
// ============================================================================

/// Envelope wrapper for application events.
///
/// The envelope provides versioning and sequence numbers for ordering and
/// replay detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Per-sender sequence number.
    pub sequence: u64,
    /// Device that produced the event.
    pub source: DeviceId,
    /// The event.
    pub payload: AppEvent,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, source: DeviceId, payload: AppEvent) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            source,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Events exchanged between paired devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    /// Key press or release.
    Keyboard(KeyboardEvent),
    /// Pointer movement, button or wheel.
    Mouse(MouseEvent),
    /// Clipboard contents.
    Clipboard(ClipboardData),
    /// Encoded screen frame.
    ScreenFrame(ScreenFrame),
}

impl AppEvent {
    /// Short event name, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AppEvent::Keyboard(_) => "keyboard",
            AppEvent::Mouse(_) => "mouse",
            AppEvent::Clipboard(_) => "clipboard",
            AppEvent::ScreenFrame(_) => "screen_frame",
        }
    }
}

/// Modifier key bit flags carried by keyboard events.
pub mod modifiers {
    /// Shift held.
    pub const SHIFT: u8 = 0b0001;
    /// Control held.
    pub const CONTROL: u8 = 0b0010;
    /// Alt or Option held.
    pub const ALT: u8 = 0b0100;
    /// Super, Command or Windows key held.
    pub const META: u8 = 0b1000;
}

/// A key press or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    /// Platform-neutral key code.
    pub key_code: u32,
    /// Bitwise OR of [`modifiers`] flags.
    pub modifiers: u8,
    /// True on press, false on release.
    pub pressed: bool,
    /// Capture time in milliseconds since the sender's epoch.
    pub timestamp_ms: u64,
}

/// Mouse buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    /// Primary button.
    Left,
    /// Secondary button.
    Right,
    /// Wheel button.
    Middle,
}

/// What happened to the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseAction {
    /// Pointer moved to `x`, `y`.
    Move,
    /// Button pressed.
    Down(MouseButton),
    /// Button released.
    Up(MouseButton),
    /// Wheel scrolled by the given deltas.
    Scroll {
        /// Horizontal delta.
        dx: i32,
        /// Vertical delta.
        dy: i32,
    },
}

/// Pointer event in normalized screen coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseEvent {
    /// Action performed.
    pub action: MouseAction,
    /// Horizontal position in 1/65535ths of the screen width.
    pub x: u16,
    /// Vertical position in 1/65535ths of the screen height.
    pub y: u16,
    /// Capture time in milliseconds since the sender's epoch.
    pub timestamp_ms: u64,
}

/// Clipboard contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardData {
    /// MIME type of `data`, e.g. `text/plain;charset=utf-8`.
    pub mime_type: String,
    /// Raw clipboard bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// One encoded screen frame. The codec is opaque to Tether.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenFrame {
    /// Frame counter, per source.
    pub frame_number: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Whether this frame can be decoded on its own.
    pub keyframe: bool,
    /// Encoded frame bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}
