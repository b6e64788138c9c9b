//! # Tether Daemon Library
//!
//! This crate provides the signaling endpoint for Tether, pairing two or
//! more devices into a verified session and routing events between them.
//!
//! ## Overview
//!
//! The daemon provides:
//!
//! - **Session Management**: code-addressed sessions with expiry, one-time
//!   codes and out-of-band fingerprint verification
//! - **Rate Limiting**: sliding windows per client and operation, with
//!   reputation-based blocking that escalates on repeated abuse
//! - **Authorization**: a role and feature table consulted for every
//!   signaling request and routed event
//! - **Routing**: fan-out of input, clipboard and screen events
//! - **Secure Links**: AEAD-sealed, replay-checked framing over any byte pipe
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Signaling   │──│ Rate Limiter │  │    Authorizer        │   │
//! │  │   Service    │  │ + Reputation │  │                      │   │
//! │  └──────┬───────┘  └──────────────┘  └──────────▲───────────┘   │
//! │         │                                       │               │
//! │  ┌──────▼───────────────────────────────────────┴────────────┐  │
//! │  │                   Session Manager                         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                                                                 │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐   │
//! │  │ Connection Router │──│        Secure Link                │   │
//! │  └───────────────────┘  └───────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     let response = orchestrator
//!         .signaling()
//!         .handle_json("client-1", r#"{"type":"heartbeat","session_id":"x","device_id":"d"}"#)
//!         .await;
//!     println!("{response}");
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`identity`]: Persistent device identity
//! - [`session`]: Session lifecycle management
//! - [`ratelimit`]: Rate limiting and client reputation
//! - [`authorization`]: Role and feature based access decisions
//! - [`signaling`]: Signaling request handling
//! - [`router`]: Event routing between participants
//! - [`transport`]: Encrypted framing over byte pipes
//! - [`orchestrator`]: Main daemon coordinator

pub mod authorization;
pub mod config;
pub mod identity;
pub mod orchestrator;
pub mod ratelimit;
pub mod router;
pub mod session;
pub mod signaling;
pub mod transport;

// Re-export protocol for convenience
pub use tether_protocol;

// Re-export config types for convenience
pub use config::Config;

pub use authorization::{Authorizer, Decision, DenialReason, Operation, Role};
pub use identity::LocalIdentity;
pub use ratelimit::{RateDecision, RateLimitedOperation, RateLimiter};

// Re-export session types for convenience
pub use session::{
    EndReason, SessionError, SessionEvent, SessionId, SessionManager, SessionManagerImpl,
    SessionSnapshot, SessionStatus,
};

pub use router::{ConnectionRouter, Delivery, Outbox, ParticipantEvent, RouterError, RouterResult};
pub use signaling::{SignalingError, SignalingService};
pub use transport::{memory_pipe_pair, BytePipe, MemoryPipe, SecureLink, TransportError};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
