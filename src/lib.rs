//! # rtermtel - Session and Telemetry Core for Network Terminals
//!
//! `rtermtel` is the backend core of a network terminal: it keeps interactive
//! SSH shells and background device-polling loops alive and relays their
//! output to a presentation layer as JSON envelopes of the form
//! `{session_id, action, payload}`.
//!
//! ## Features
//!
//! - **Interactive Shells**: PTY shells over SSH with password or key authentication
//! - **Telemetry Polling**: facts, interfaces, LLDP neighbors, default routes and environment, every few seconds
//! - **Fault Isolation**: one failing telemetry category never voids the others
//! - **Backoff**: device facts are retried with exponential backoff before a cycle is given up
//! - **Dual Dispatch**: works from inside a tokio runtime or from plain synchronous code
//! - **Maximum Compatibility**: legacy SSH algorithms for older switches and routers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtermtel::config::CoreConfig;
//! use rtermtel::driver::DriverRegistry;
//! use rtermtel::router::Router;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (router, mut outbound) = Router::new(CoreConfig::default(), DriverRegistry::with_builtin());
//!
//!     router.handle_inbound(
//!         r#"{"session_id": "telemetry", "action": "connect",
//!             "payload": {"host": "192.0.2.10", "username": "admin", "password": "secret"}}"#,
//!     );
//!
//!     while let Some(envelope) = outbound.recv().await {
//!         println!("{}", envelope.to_json());
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`router`]: inbound entry point and dispatch strategy
//! - [`session`]: the terminal, telemetry and UI-state sessions
//! - [`telemetry`]: update model, normalization, retry policy and collector
//! - [`driver`]: device driver contract, platforms and the built-in Linux driver
//! - [`envelope`]: wire type, sanitization and outbound emission
//! - [`worker`]: background runtime and worker lifecycle
//! - [`config`]: SSH algorithm profiles and runtime settings
//! - [`error`]: error types

pub mod config;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod worker;
