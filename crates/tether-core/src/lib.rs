//! Core of the tether desktop supervisor.
//!
//! tether starts and mediates access to two long-running local services:
//! a keystore daemon that holds signing keys and a peer-to-peer runtime
//! ("conductor") that hosts applications. UI windows never talk to the
//! keystore directly; every signing request goes through the
//! [`authz::WindowAuthorizations`] map first.
//!
//! # Architecture
//!
//! ```text
//! RPC boundary (tether-cli)
//!     |
//!     v
//! Launcher ----publish----> EventBus ----> onProgress subscribers
//!     |                                  \--> log sink
//!     |-- Supervisor (keystore)
//!     |-- Supervisor (runtime)  --> RuntimeTable[data root name]
//!     |
//!     \-- WindowAuthorizations --> SigningGate --> ZomeCallSigner
//! ```

pub mod admin;
pub mod authz;
pub mod data_root;
pub mod error;
pub mod events;
pub mod launcher;
pub mod layout;
pub mod runtime_table;
pub mod secret;
pub mod signing;
pub mod supervisor;
pub mod window;

pub use error::{LauncherError, LauncherResult};
pub use secret::Secret;
