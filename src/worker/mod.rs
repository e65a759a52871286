//! The background cache worker.
//!
//! Owns the per-class cache stores and arbitrates every intercepted
//! fetch between cache and network. Clients talk to it exclusively
//! through the message protocol in `messages`; worker-side errors are
//! always converted to typed event payloads, never thrown across the
//! boundary.

pub mod messages;
pub mod populate;
pub mod runtime;
pub mod update;

pub use messages::{ClientMessage, WorkerEvent};
pub use runtime::WorkerRuntime;
