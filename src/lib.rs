//! Policy automaton: runs user-signed recurring on-chain policies.
//!
//! A scheduler fires policy triggers on their interval schedule, a worker
//! asks the policy's plugin for transaction proposals, co-signs each one with
//! the counterpart server through a two-party signing session, and hands the
//! signature back to the plugin for broadcast. Policy and transaction state
//! is replicated to the counterpart as it changes.

pub mod auth;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod plugin;
pub mod policy;
pub mod queue;
pub mod schedule;
pub mod scheduler;
pub mod signing;
pub mod state;
pub mod sync;
pub mod types;
