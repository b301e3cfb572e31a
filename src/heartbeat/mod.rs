//! Worker → master cache state synchronization.
//!
//! - [`delta`]: added/removed block bookkeeping between heartbeats
//! - [`synchronizer`]: the periodic heartbeat task

pub mod delta;
pub mod synchronizer;
