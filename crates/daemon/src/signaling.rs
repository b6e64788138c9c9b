//! Signaling request handling.
//!
//! This module provides the `SignalingService` that answers
//! [`SignalingRequest`]s: every request passes the rate limiter first, is
//! then dispatched to the session manager, and its outcome feeds the
//! client's reputation.

use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{
    DeviceFingerprint, DeviceId, ErrorCode, ErrorMessage, SignalingRequest, SignalingResponse,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::authorization::{Authorizer, Decision, DenialReason, Operation, Role};
use crate::ratelimit::{RateDecision, RateLimitedOperation, RateLimiter};
use crate::session::{
    EndReason, Participant, SessionError, SessionId, SessionManager, SessionManagerImpl,
};

/// Longest timeout a client may request.
const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Errors produced while handling a signaling request.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The device may not perform the request.
    #[error("unauthorized: {0}")]
    Unauthorized(DenialReason),

    /// The fingerprint matched no participant.
    #[error("verification failed for session {0}")]
    VerificationFailed(SessionId),
}

impl SignalingError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalingError::Session(e) => match e {
                SessionError::NotFound(_) => ErrorCode::NotFound,
                SessionError::InvalidCode(_) => ErrorCode::InvalidCode,
                SessionError::Expired(_) => ErrorCode::Expired,
                SessionError::AlreadyUsed(_) => ErrorCode::AlreadyUsed,
                SessionError::SessionFull { .. } => ErrorCode::SessionFull,
                SessionError::NotParticipant(_) => ErrorCode::Unauthorized,
                SessionError::AlreadyParticipant(_)
                | SessionError::InvalidState { .. }
                | SessionError::HostRoleTaken => ErrorCode::InvalidRequest,
                SessionError::TooManySessions(_) => ErrorCode::InternalError,
            },
            SignalingError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SignalingError::Unauthorized(DenialReason::UnknownSession) => ErrorCode::NotFound,
            SignalingError::Unauthorized(_) => ErrorCode::Unauthorized,
            SignalingError::VerificationFailed(_) => ErrorCode::Unauthorized,
        }
    }

    /// Whether the error suggests probing and should hurt the client's
    /// reputation.
    pub fn counts_as_failure(&self) -> bool {
        match self {
            SignalingError::Session(e) => !matches!(
                e,
                SessionError::SessionFull { .. }
                    | SessionError::TooManySessions(_)
                    | SessionError::InvalidState { .. }
            ),
            SignalingError::InvalidRequest(_)
            | SignalingError::Unauthorized(_)
            | SignalingError::VerificationFailed(_) => true,
        }
    }

    /// Converts the error into the response sent to the client.
    pub fn into_response(self) -> SignalingResponse {
        match self {
            // A failed comparison is an answer, not a fault
            SignalingError::VerificationFailed(session_id) => SignalingResponse::SessionVerified {
                session_id,
                verified: false,
            },
            other => SignalingResponse::Error(ErrorMessage {
                code: other.code(),
                message: other.to_string(),
                retry_after_ms: None,
            }),
        }
    }
}

/// Answers signaling requests.
pub struct SignalingService {
    sessions: Arc<SessionManagerImpl>,
    limiter: Arc<RateLimiter>,
    authorizer: Arc<Authorizer>,
}

impl SignalingService {
    pub fn new(sessions: Arc<SessionManagerImpl>, limiter: Arc<RateLimiter>) -> Self {
        let authorizer = Arc::clone(sessions.authorizer());
        Self {
            sessions,
            limiter,
            authorizer,
        }
    }

    /// Handles one request from `client_id` (typically the peer address).
    pub async fn handle(&self, client_id: &str, request: SignalingRequest) -> SignalingResponse {
        let kind = request.kind();
        let operation = rate_limited_operation(&request);

        match self.limiter.is_allowed(client_id, operation, 1) {
            RateDecision::Allowed => {}
            RateDecision::LimitExceeded { retry_after } => {
                return refusal(
                    ErrorCode::RateLimited,
                    format!("too many {} requests", operation),
                    retry_after,
                );
            }
            RateDecision::Blocked { until, reason } => {
                warn!(client_id = %client_id, request = kind, "Request from blocked client");
                let retry_after = until.saturating_duration_since(Instant::now());
                return refusal(ErrorCode::Blocked, reason, retry_after);
            }
        }

        match self.dispatch(client_id, request).await {
            Ok(response) => {
                self.limiter.record_success(client_id);
                debug!(client_id = %client_id, request = kind, "Signaling request handled");
                response
            }
            Err(e) => {
                if e.counts_as_failure() {
                    self.limiter.record_failed_attempt(client_id);
                }
                warn!(client_id = %client_id, request = kind, error = %e, "Signaling request failed");
                e.into_response()
            }
        }
    }

    /// Handles a JSON-encoded request and returns the JSON response.
    pub async fn handle_json(&self, client_id: &str, request: &str) -> String {
        let response = match SignalingRequest::from_json(request) {
            Ok(request) => self.handle(client_id, request).await,
            Err(e) => {
                self.limiter.record_failed_attempt(client_id);
                SignalingError::InvalidRequest(e.to_string()).into_response()
            }
        };
        response.to_json().unwrap_or_else(|e| {
            // Serializing our own response types does not fail in practice
            format!(
                r#"{{"type":"error","code":"internal_error","message":"{}"}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }

    async fn dispatch(
        &self,
        client_id: &str,
        request: SignalingRequest,
    ) -> Result<SignalingResponse, SignalingError> {
        match request {
            SignalingRequest::CreateSession {
                device_id,
                device_fingerprint,
                timeout_secs,
                features,
            } => {
                let creator =
                    Participant::new(device_id.clone(), parse_fingerprint(&device_fingerprint)?);
                let timeout = match timeout_secs {
                    None => None,
                    Some(secs) if secs == 0 || secs > MAX_TIMEOUT_SECS => {
                        return Err(SignalingError::InvalidRequest(format!(
                            "timeout must be between 1 and {} seconds",
                            MAX_TIMEOUT_SECS
                        )));
                    }
                    Some(secs) => Some(Duration::from_secs(secs)),
                };

                let session = self
                    .sessions
                    .create_session(creator, timeout, features)
                    .await?;
                self.authorizer.bind_client(&session.id, &device_id, client_id);
                Ok(SignalingResponse::SessionCreated {
                    session_id: session.id,
                    session_code: session.code.as_str().to_string(),
                    expires_at: session.expires_at_ms,
                })
            }

            SignalingRequest::JoinSession {
                session_code,
                device_id,
                device_fingerprint,
            } => {
                let joiner =
                    Participant::new(device_id.clone(), parse_fingerprint(&device_fingerprint)?);
                let session = self.sessions.join_session(&session_code).await?;
                let session = self
                    .sessions
                    .attach_participant(&session.id, joiner, Role::Guest)
                    .await?;
                self.authorizer.bind_client(&session.id, &device_id, client_id);
                Ok(SignalingResponse::SessionJoined {
                    session_id: session.id,
                    host_device_id: session.host.device_id,
                    host_fingerprint: session.host.fingerprint.to_hex(),
                    features: session.features,
                    expires_at: session.expires_at_ms,
                })
            }

            SignalingRequest::VerifySession {
                session_id,
                device_id,
                device_fingerprint,
            } => {
                self.authorize(&session_id, &device_id, Operation::ManageSession)?;
                self.check_client(&session_id, &device_id, client_id)?;
                if self
                    .sessions
                    .verify_session(&session_id, &device_fingerprint)
                    .await?
                {
                    Ok(SignalingResponse::SessionVerified {
                        session_id,
                        verified: true,
                    })
                } else {
                    Err(SignalingError::VerificationFailed(session_id))
                }
            }

            SignalingRequest::Heartbeat {
                session_id,
                device_id,
            } => {
                self.authorize(&session_id, &device_id, Operation::Heartbeat)?;
                self.check_client(&session_id, &device_id, client_id)?;
                let status = self.sessions.heartbeat(&session_id, &device_id).await?;
                Ok(SignalingResponse::HeartbeatAck {
                    session_id,
                    status: status.to_string(),
                })
            }

            SignalingRequest::EndSession {
                session_id,
                device_id,
            } => {
                match self.authorizer.role_of(&session_id, &device_id) {
                    Some(Role::Host) => {
                        self.authorize(&session_id, &device_id, Operation::ManageSession)?;
                        self.check_client(&session_id, &device_id, client_id)?;
                        self.sessions
                            .end_session(&session_id, EndReason::Requested)
                            .await;
                    }
                    Some(_) => {
                        self.check_client(&session_id, &device_id, client_id)?;
                        self.sessions
                            .remove_participant(&session_id, &device_id)
                            .await?;
                    }
                    None => {
                        // Let the authorizer pick the denial reason
                        self.authorize(&session_id, &device_id, Operation::Heartbeat)?;
                    }
                }
                Ok(SignalingResponse::SessionEnded { session_id })
            }
        }
    }

    /// Rejects requests that name a device registered by another client.
    fn check_client(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
        client_id: &str,
    ) -> Result<(), SignalingError> {
        if self.authorizer.is_bound_to(session_id, device_id, client_id) {
            return Ok(());
        }
        warn!(
            session_id = %session_id,
            device_id = %device_id,
            client_id = %client_id,
            "Request for a device registered by another client"
        );
        Err(SignalingError::Unauthorized(DenialReason::ClientMismatch))
    }

    fn authorize(
        &self,
        session_id: &SessionId,
        device_id: &DeviceId,
        operation: Operation,
    ) -> Result<(), SignalingError> {
        match self
            .authorizer
            .authorize(session_id, device_id, operation, None)
        {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => Err(SignalingError::Unauthorized(reason)),
        }
    }
}

fn rate_limited_operation(request: &SignalingRequest) -> RateLimitedOperation {
    match request {
        SignalingRequest::CreateSession { .. } => RateLimitedOperation::Create,
        SignalingRequest::JoinSession { .. } => RateLimitedOperation::Join,
        SignalingRequest::VerifySession { .. } => RateLimitedOperation::Verify,
        SignalingRequest::Heartbeat { .. } | SignalingRequest::EndSession { .. } => {
            RateLimitedOperation::Heartbeat
        }
    }
}

fn parse_fingerprint(hex: &str) -> Result<DeviceFingerprint, SignalingError> {
    DeviceFingerprint::from_hex(hex)
        .map_err(|e| SignalingError::InvalidRequest(format!("device_fingerprint: {}", e)))
}

fn refusal(code: ErrorCode, message: String, retry_after: Duration) -> SignalingResponse {
    SignalingResponse::Error(ErrorMessage {
        code,
        message,
        retry_after_ms: Some(retry_after.as_millis() as u64),
    })
}
