#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! mignon-relay library — a supervisor for declaratively configured SSH
//! port-forwarding tunnels.
//!
//! The host (CLI, GUI, daemon) edits an encrypted declarative config through
//! [`store::ConfigStore`] and hands it to [`supervisor::TunnelSupervisor`],
//! which diff-reconciles the set of live tunnel sessions against it. Each
//! session maintains one SSH connection with bounded reconnection and relays
//! TCP either outward (forward, `-L`) or inward (reverse, `-R`).
//!
//! Building blocks:
//! - `store` — encrypted declarative config (servers, links, UI flags)
//! - `crypto` — AES-128-CBC + PKCS#7 codec behind the config file format
//! - `dial` — proxy resolution and the TCP/SOCKS5 dialer
//! - `session` — one tunnel session: dial, auth, listen, forward, retry
//! - `supervisor` — the live tunnel set, reconciliation and lifecycle events
//! - `settings` — host-level TOML settings (file locations, log level)
//! - `logging` — tracing setup with a rolling log file

pub mod crypto;
pub mod dial;
pub mod logging;
pub mod session;
pub mod settings;
pub mod store;
pub mod supervisor;

// Re-export key types at crate root for convenience.
pub use session::{RetryPolicy, SessionError, SessionHandle};
pub use settings::Settings;
pub use store::{Config, ConfigStore, Link, ServerGroup};
pub use supervisor::{TunnelEvent, TunnelSupervisor};
