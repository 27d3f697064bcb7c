//! Connection supervisor
//!
//! Keeps the gateway's broker session connected:
//!
//! - [`state`] - Pure control flags, lifecycle states and retry decisions
//! - [`controller`] - The background task and the handle used to control it

pub mod controller;
pub mod state;

pub use controller::{event_channel, ConnectionSupervisor, SupervisorError};
pub use state::{
    decide_next_action, ControlFlags, SupervisorAction, SupervisorSettings, SupervisorState,
    SupervisorStats,
};
