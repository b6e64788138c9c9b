//! Role-based authorization for session operations.
//!
//! Every operation a device attempts inside a session is checked here before
//! it reaches the router. The rule table is a pure function of the operation,
//! the device's role, the session's feature flags and its verification state;
//! anything the table does not explicitly allow is denied.
//!
//! Contexts are kept in their own concurrent map so that authorization checks
//! never contend with the session manager's per-session locks.

use std::collections::HashMap;
use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tether_protocol::{DeviceId, SessionFeatures};

use crate::session::SessionId;

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Inject key events into other participants.
    KeyboardInput,
    /// Inject pointer events into other participants.
    MouseInput,
    /// Push clipboard contents.
    ClipboardSend,
    /// Accept clipboard contents.
    ClipboardReceive,
    /// Publish screen frames.
    ScreenShare,
    /// Receive screen frames.
    ScreenView,
    /// Change features, remove participants or end the session.
    ManageSession,
    /// Keep the session alive.
    Heartbeat,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Operation; 8] = [
        Operation::KeyboardInput,
        Operation::MouseInput,
        Operation::ClipboardSend,
        Operation::ClipboardReceive,
        Operation::ScreenShare,
        Operation::ScreenView,
        Operation::ManageSession,
        Operation::Heartbeat,
    ];

    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::KeyboardInput => "keyboard_input",
            Operation::MouseInput => "mouse_input",
            Operation::ClipboardSend => "clipboard_send",
            Operation::ClipboardReceive => "clipboard_receive",
            Operation::ScreenShare => "screen_share",
            Operation::ScreenView => "screen_view",
            Operation::ManageSession => "manage_session",
            Operation::Heartbeat => "heartbeat",
        }
    }

    /// Operations that move user data or control between devices.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            Operation::KeyboardInput
                | Operation::MouseInput
                | Operation::ClipboardSend
                | Operation::ScreenShare
                | Operation::ScreenView
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// A device's role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The device that created the session.
    Host,
    /// A joined device with interactive rights.
    Guest,
    /// A joined device that may only watch.
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// Why an operation was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// No authorization context exists for the session.
    UnknownSession,
    /// The device is not a participant of the session.
    UnknownDevice,
    /// The operation name is not recognized.
    UnknownOperation(String),
    /// The role may never perform the operation.
    RoleNotPermitted { operation: Operation, role: Role },
    /// The operation needs a feature flag that is off.
    FeatureDisabled(&'static str),
    /// The session has not been verified yet.
    NotVerified,
    /// The targeted device is not a participant of the session.
    ResourceNotParticipant,
    /// The request did not come from the client that registered the device.
    ClientMismatch,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::UnknownSession => write!(f, "unknown session"),
            DenialReason::UnknownDevice => write!(f, "device is not a participant"),
            DenialReason::UnknownOperation(name) => write!(f, "unknown operation: {}", name),
            DenialReason::RoleNotPermitted { operation, role } => {
                write!(f, "{} is not permitted for role {}", operation, role)
            }
            DenialReason::FeatureDisabled(feature) => write!(f, "feature disabled: {}", feature),
            DenialReason::NotVerified => write!(f, "session is not verified"),
            DenialReason::ResourceNotParticipant => {
                write!(f, "target device is not a participant")
            }
            DenialReason::ClientMismatch => {
                write!(f, "device is registered to another client")
            }
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The operation may proceed.
    Allowed,
    /// The operation is refused.
    Denied(DenialReason),
}

impl Decision {
    /// Returns true for [`Decision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Session-level facts the rule table depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleInputs {
    /// Enabled feature flags.
    pub features: SessionFeatures,
    /// Whether the session has been verified.
    pub verified: bool,
    /// Whether sensitive operations wait for verification.
    pub require_verification: bool,
}

/// The rule table.
///
/// Pure: the same inputs always produce the same decision.
pub fn evaluate(operation: Operation, role: Role, inputs: &RuleInputs) -> Decision {
    use Decision::Allowed;
    use Operation::*;
    use Role::*;

    let not_permitted = || Decision::Denied(DenialReason::RoleNotPermitted { operation, role });

    let by_role = match (operation, role) {
        (KeyboardInput | MouseInput | ManageSession, Host) => Allowed,
        (KeyboardInput | MouseInput | ManageSession, Guest | Viewer) => not_permitted(),

        (ClipboardReceive | Heartbeat, Host | Guest | Viewer) => Allowed,

        (ClipboardSend, Host) => Allowed,
        (ClipboardSend, Guest) if inputs.features.clipboard_sync => Allowed,
        (ClipboardSend, Guest) => Decision::Denied(DenialReason::FeatureDisabled("clipboard_sync")),
        (ClipboardSend, Viewer) => not_permitted(),

        (ScreenShare, Viewer) => not_permitted(),
        (ScreenShare, Host | Guest) if !inputs.features.screen_sharing => {
            Decision::Denied(DenialReason::FeatureDisabled("screen_sharing"))
        }
        (ScreenShare, Host | Guest) if !inputs.verified => {
            Decision::Denied(DenialReason::NotVerified)
        }
        (ScreenShare, Host | Guest) => Allowed,

        (ScreenView, Host | Guest | Viewer) if inputs.features.screen_sharing => Allowed,
        (ScreenView, Host | Guest | Viewer) => {
            Decision::Denied(DenialReason::FeatureDisabled("screen_sharing"))
        }
    };

    match by_role {
        Allowed if operation.is_sensitive() && inputs.require_verification && !inputs.verified => {
            Decision::Denied(DenialReason::NotVerified)
        }
        decision => decision,
    }
}

/// Authorization state of one session.
#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    roles: HashMap<DeviceId, Role>,
    /// Signaling client each device registered from.
    clients: HashMap<DeviceId, String>,
    inputs: RuleInputs,
}

impl AuthorizationContext {
    /// Role of a device, if it participates.
    pub fn role_of(&self, device_id: &DeviceId) -> Option<Role> {
        self.roles.get(device_id).copied()
    }

    /// Session-level rule inputs.
    pub fn inputs(&self) -> RuleInputs {
        self.inputs
    }
}

/// Concurrent store of per-session authorization contexts.
#[derive(Debug, Default)]
pub struct Authorizer {
    contexts: DashMap<SessionId, AuthorizationContext>,
}

impl Authorizer {
    /// Creates an empty authorizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session with its host.
    pub fn register_session(
        &self,
        session_id: &SessionId,
        host: &DeviceId,
        features: SessionFeatures,
        require_verification: bool,
    ) {
        let mut roles = HashMap::new();
        roles.insert(host.clone(), Role::Host);
        self.contexts.insert(
            session_id.clone(),
            AuthorizationContext {
                roles,
                clients: HashMap::new(),
                inputs: RuleInputs {
                    features,
                    verified: false,
                    require_verification,
                },
            },
        );
    }

    /// Adds or updates a participant's role. Returns false for unknown sessions.
    pub fn add_participant(&self, session_id: &SessionId, device_id: &DeviceId, role: Role) -> bool {
        match self.contexts.get_mut(session_id) {
            Some(mut ctx) => {
                ctx.roles.insert(device_id.clone(), role);
                true
            }
            None => false,
        }
    }

    /// Removes a participant.
    pub fn remove_participant(&self, session_id: &SessionId, device_id: &DeviceId) {
        if let Some(mut ctx) = self.contexts.get_mut(session_id) {
            ctx.roles.remove(device_id);
            ctx.clients.remove(device_id);
        }
    }

    /// Ties a participant to the signaling client it registered from.
    ///
    /// Returns false if the device is not a participant of the session.
    pub fn bind_client(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
        client_id: &str,
    ) -> bool {
        match self.contexts.get_mut(session_id) {
            Some(mut ctx) if ctx.roles.contains_key(device_id) => {
                ctx.clients.insert(device_id.clone(), client_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Whether `client_id` is the client `device_id` registered from.
    ///
    /// Devices without a binding match no client.
    pub fn is_bound_to(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
        client_id: &str,
    ) -> bool {
        self.contexts.get(session_id).is_some_and(|ctx| {
            ctx.clients
                .get(device_id)
                .is_some_and(|bound| bound == client_id)
        })
    }

    /// Marks a session verified.
    pub fn set_verified(&self, session_id: &SessionId, verified: bool) {
        if let Some(mut ctx) = self.contexts.get_mut(session_id) {
            ctx.inputs.verified = verified;
        }
    }

    /// Replaces a session's feature flags.
    pub fn set_features(&self, session_id: &SessionId, features: SessionFeatures) {
        if let Some(mut ctx) = self.contexts.get_mut(session_id) {
            ctx.inputs.features = features;
        }
    }

    /// Drops a session's context; later checks for it are denied.
    pub fn remove_session(&self, session_id: &SessionId) {
        self.contexts.remove(session_id);
    }

    /// Snapshot of a session's context.
    pub fn context(&self, session_id: &SessionId) -> Option<AuthorizationContext> {
        self.contexts.get(session_id).map(|ctx| ctx.clone())
    }

    /// Role of a device in a session.
    pub fn role_of(&self, session_id: &SessionId, device_id: &DeviceId) -> Option<Role> {
        self.contexts
            .get(session_id)
            .and_then(|ctx| ctx.role_of(device_id))
    }

    /// Checks whether `device_id` may perform `operation` in `session_id`.
    ///
    /// When `resource` names a target device, that device must also be a
    /// participant of the session.
    pub fn authorize(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
        operation: Operation,
        resource: Option<&DeviceId>,
    ) -> Decision {
        let Some(ctx) = self.contexts.get(session_id) else {
            return Decision::Denied(DenialReason::UnknownSession);
        };
        let Some(role) = ctx.role_of(device_id) else {
            return Decision::Denied(DenialReason::UnknownDevice);
        };
        if let Some(target) = resource {
            if !ctx.roles.contains_key(target) {
                return Decision::Denied(DenialReason::ResourceNotParticipant);
            }
        }

        let decision = evaluate(operation, role, &ctx.inputs);
        if let Decision::Denied(reason) = &decision {
            tracing::debug!(
                session_id = %session_id,
                device_id = %device_id,
                operation = %operation,
                reason = %reason,
                "Operation denied"
            );
        }
        decision
    }

    /// Like [`Authorizer::authorize`] for an operation given by name.
    ///
    /// Unrecognized names are denied.
    pub fn authorize_named(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
        operation: &str,
        resource: Option<&DeviceId>,
    ) -> Decision {
        match operation.parse::<Operation>() {
            Ok(op) => self.authorize(session_id, device_id, op, resource),
            Err(name) => Decision::Denied(DenialReason::UnknownOperation(name)),
        }
    }

    /// Number of tracked sessions.
    pub fn session_count(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLES: [Role; 3] = [Role::Host, Role::Guest, Role::Viewer];

    fn inputs(clipboard_sync: bool, screen_sharing: bool, verified: bool) -> RuleInputs {
        RuleInputs {
            features: SessionFeatures {
                clipboard_sync,
                screen_sharing,
            },
            verified,
            require_verification: true,
        }
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn test_input_and_management_are_host_only() {
        let all_on = inputs(true, true, true);
        for op in [
            Operation::KeyboardInput,
            Operation::MouseInput,
            Operation::ManageSession,
        ] {
            assert_eq!(evaluate(op, Role::Host, &all_on), Decision::Allowed);
            for role in [Role::Guest, Role::Viewer] {
                assert_eq!(
                    evaluate(op, role, &all_on),
                    Decision::Denied(DenialReason::RoleNotPermitted {
                        operation: op,
                        role
                    })
                );
            }
        }
    }

    #[test]
    fn test_clipboard_receive_and_heartbeat_open_to_all() {
        let nothing = inputs(false, false, false);
        for role in ROLES {
            assert!(evaluate(Operation::ClipboardReceive, role, &nothing).is_allowed());
            assert!(evaluate(Operation::Heartbeat, role, &nothing).is_allowed());
        }
    }

    #[test]
    fn test_guest_clipboard_send_needs_flag() {
        assert_eq!(
            evaluate(Operation::ClipboardSend, Role::Guest, &inputs(false, false, true)),
            Decision::Denied(DenialReason::FeatureDisabled("clipboard_sync"))
        );
        assert!(evaluate(Operation::ClipboardSend, Role::Guest, &inputs(true, false, true)).is_allowed());
        assert!(evaluate(Operation::ClipboardSend, Role::Host, &inputs(false, false, true)).is_allowed());
        assert!(!evaluate(Operation::ClipboardSend, Role::Viewer, &inputs(true, true, true)).is_allowed());
    }

    #[test]
    fn test_screen_share_needs_flag_and_verification() {
        // Verification is required for screen sharing even when the session
        // does not otherwise require it
        let mut unverified = inputs(false, true, false);
        unverified.require_verification = false;

        assert_eq!(
            evaluate(Operation::ScreenShare, Role::Host, &inputs(false, false, true)),
            Decision::Denied(DenialReason::FeatureDisabled("screen_sharing"))
        );
        assert_eq!(
            evaluate(Operation::ScreenShare, Role::Host, &unverified),
            Decision::Denied(DenialReason::NotVerified)
        );
        assert!(evaluate(Operation::ScreenShare, Role::Guest, &inputs(false, true, true)).is_allowed());
        assert!(!evaluate(Operation::ScreenShare, Role::Viewer, &inputs(true, true, true)).is_allowed());
    }

    #[test]
    fn test_screen_view_needs_flag() {
        for role in ROLES {
            assert!(evaluate(Operation::ScreenView, role, &inputs(false, true, true)).is_allowed());
            assert!(!evaluate(Operation::ScreenView, role, &inputs(false, false, true)).is_allowed());
        }
    }

    #[test]
    fn test_sensitive_operations_wait_for_verification() {
        let unverified = inputs(true, true, false);
        assert_eq!(
            evaluate(Operation::KeyboardInput, Role::Host, &unverified),
            Decision::Denied(DenialReason::NotVerified)
        );
        assert_eq!(
            evaluate(Operation::ClipboardSend, Role::Guest, &unverified),
            Decision::Denied(DenialReason::NotVerified)
        );
        // Non-sensitive operations are unaffected
        assert!(evaluate(Operation::ManageSession, Role::Host, &unverified).is_allowed());
        assert!(evaluate(Operation::ClipboardReceive, Role::Viewer, &unverified).is_allowed());

        let mut relaxed = unverified;
        relaxed.require_verification = false;
        assert!(evaluate(Operation::KeyboardInput, Role::Host, &relaxed).is_allowed());
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        for op in Operation::ALL {
            for role in ROLES {
                for bits in 0..8u8 {
                    let i = inputs(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
                    assert_eq!(evaluate(op, role, &i), evaluate(op, role, &i));
                }
            }
        }
    }

    #[test]
    fn test_operation_names_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
            assert_eq!(
                serde_json::to_string(&op).unwrap(),
                format!("\"{}\"", op.as_str())
            );
        }
        assert!("format_disk".parse::<Operation>().is_err());
    }

    #[test]
    fn test_authorizer_fails_closed() {
        let authz = Authorizer::new();
        let session = "s1".to_string();
        let host = device("host");
        let guest = device("guest");

        assert_eq!(
            authz.authorize(&session, &host, Operation::Heartbeat, None),
            Decision::Denied(DenialReason::UnknownSession)
        );

        authz.register_session(&session, &host, SessionFeatures::default(), true);
        assert_eq!(
            authz.authorize(&session, &guest, Operation::Heartbeat, None),
            Decision::Denied(DenialReason::UnknownDevice)
        );
        assert_eq!(
            authz.authorize_named(&session, &host, "reboot", None),
            Decision::Denied(DenialReason::UnknownOperation("reboot".to_string()))
        );
        assert!(authz
            .authorize_named(&session, &host, "heartbeat", None)
            .is_allowed());
    }

    #[test]
    fn test_authorizer_tracks_roles_and_verification() {
        let authz = Authorizer::new();
        let session = "s1".to_string();
        let host = device("host");
        let guest = device("guest");

        authz.register_session(&session, &host, SessionFeatures::default(), true);
        assert!(authz.add_participant(&session, &guest, Role::Guest));
        assert_eq!(authz.role_of(&session, &guest), Some(Role::Guest));

        assert!(!authz
            .authorize(&session, &host, Operation::KeyboardInput, Some(&guest))
            .is_allowed());
        authz.set_verified(&session, true);
        assert!(authz
            .authorize(&session, &host, Operation::KeyboardInput, Some(&guest))
            .is_allowed());

        authz.remove_participant(&session, &guest);
        assert_eq!(
            authz.authorize(&session, &host, Operation::KeyboardInput, Some(&guest)),
            Decision::Denied(DenialReason::ResourceNotParticipant)
        );

        authz.remove_session(&session);
        assert_eq!(authz.session_count(), 0);
        assert!(!authz.add_participant(&session, &guest, Role::Guest));
    }

    #[test]
    fn test_feature_changes_apply_immediately() {
        let authz = Authorizer::new();
        let session = "s1".to_string();
        let host = device("host");
        let guest = device("guest");

        authz.register_session(&session, &host, SessionFeatures::default(), false);
        authz.add_participant(&session, &guest, Role::Guest);
        assert!(!authz
            .authorize(&session, &guest, Operation::ClipboardSend, None)
            .is_allowed());

        authz.set_features(
            &session,
            SessionFeatures {
                clipboard_sync: true,
                screen_sharing: false,
            },
        );
        assert!(authz
            .authorize(&session, &guest, Operation::ClipboardSend, None)
            .is_allowed());
        assert!(authz.context(&session).unwrap().inputs().features.clipboard_sync);
    }

    #[test]
    fn test_client_binding() {
        let authz = Authorizer::new();
        let session = "s1".to_string();
        let host = device("host");
        let guest = device("guest");

        authz.register_session(&session, &host, SessionFeatures::default(), true);
        assert!(authz.bind_client(&session, &host, "host-addr"));
        // Not a participant yet
        assert!(!authz.bind_client(&session, &guest, "guest-addr"));
        authz.add_participant(&session, &guest, Role::Guest);
        assert!(authz.bind_client(&session, &guest, "guest-addr"));

        assert!(authz.is_bound_to(&session, &host, "host-addr"));
        assert!(!authz.is_bound_to(&session, &host, "guest-addr"));
        assert!(!authz.is_bound_to(&"other".to_string(), &host, "host-addr"));

        authz.remove_participant(&session, &guest);
        authz.add_participant(&session, &guest, Role::Guest);
        assert!(!authz.is_bound_to(&session, &guest, "guest-addr"));
    }

    #[test]
    fn test_denial_reason_display() {
        assert_eq!(
            DenialReason::RoleNotPermitted {
                operation: Operation::MouseInput,
                role: Role::Viewer
            }
            .to_string(),
            "mouse_input is not permitted for role viewer"
        );
        assert_eq!(
            DenialReason::FeatureDisabled("clipboard_sync").to_string(),
            "feature disabled: clipboard_sync"
        );
        assert_eq!(
            DenialReason::ClientMismatch.to_string(),
            "device is registered to another client"
        );
    }
}
