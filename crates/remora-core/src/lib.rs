//! # Remora Core
//!
//! Shared vocabulary for the Remora script host:
//!
//! - [`ResultChannel`] - correlates one asynchronous call with one outcome
//! - [`CallError`] - errors surfaced through a result channel
//! - [`HostState`] / [`HostEvent`] - the host lifecycle state machine

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod channel;
pub mod error;
pub mod event;

pub use channel::{CallOutcome, ResultChannel};
pub use error::CallError;
pub use event::{HostEvent, HostState};
