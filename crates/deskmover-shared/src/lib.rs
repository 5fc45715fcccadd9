//! Shared protocol between the deskmover controller and its worker
//!
//! The controller and the worker talk over a fixed-size shared-memory
//! segment guarded by a named mutex and two auto-reset events.
//!
//! # Architecture
//!
//! - [`Message`] - The fixed-layout record that crosses the process boundary
//! - [`Channel`] - Transport abstraction (mutex + command/response events + shared message)
//! - [`SharedChannel`] - Named kernel objects, Windows only
//! - [`LocalChannel`] - In-process channel with the same semantics
//! - [`Session`] - Client side: one call = one transaction, plus batched operations
//! - [`Server`] - Worker side: wait, dispatch against a [`Desktop`], respond
//!
//! # Transaction
//!
//! ```text
//! client                         server
//! ──────                         ──────
//! lock mutex
//! wait response-ready   <─────── (signaled at startup / after last reply)
//! write message
//! signal command-ready  ───────> wake, clear status, dispatch
//! wait response-ready   <─────── write results, signal response-ready
//! read message (if no errors)
//! signal response-ready          (idle token for the next client)
//! unlock mutex
//! ```

#![deny(missing_docs)]

pub mod channel;
pub mod error;
#[cfg(windows)]
pub mod ipc;
pub mod local;
pub mod logging;
pub mod messages;
pub mod server;
pub mod session;

pub use channel::*;
pub use error::{Error, Result};
#[cfg(windows)]
pub use ipc::SharedChannel;
pub use local::{LocalChannel, MemoryDesktop, Transaction};
pub use logging::LogFile;
pub use messages::*;
pub use server::{ArrangementFlag, Desktop, Server, ServerExit};
pub use session::{HostMonitor, MoveReport, NoHostMonitor, Session, SessionConfig, TransactionScope};

/// Capacity of the item array carried by one message
pub const MAX_ITEMS: usize = 256;

/// Width of an item name buffer in UTF-16 units, terminator included
pub const MAX_NAME_LEN: usize = 256;

/// Width of the error message buffer in UTF-16 units, terminator included
pub const MAX_ERROR_LEN: usize = 512;
