//! # rtwire-core
//!
//! Pure connection logic for rtwire (no I/O, instant tests).
//!
//! This crate holds the parts of the connection core that can be expressed
//! as functions of their inputs:
//! - [`state`] - the per-state descriptor table, transition validation,
//!   timeout follow-ups and the effects of entering each state
//! - [`ledger`] - the pending-message ledger keyed by serial
//! - [`hosts`] - fallback host selection
//! - [`classify`] - fatal / token / recoverable error classification
//!
//! The actual I/O (transports, timers, callbacks) is performed by
//! `rtwire-client`, which interprets the [`Effect`]s produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod hosts;
pub mod ledger;
pub mod state;

pub use classify::{CodeRange, ErrorClass, ErrorClassifier};
pub use hosts::Hosts;
pub use ledger::{LedgerError, PendingLedger, PendingMessage, Resolution};
pub use state::{
    ConnectionEvent, ConnectionState, ConnectionStateChange, Effect, StateChangeRequest,
    StateDescriptor, StateTable, StateTimeouts, TimeoutTransition, Verdict,
};
