//! Testing utilities and mock implementations
//!
//! Provides a mock broker session so the connection supervisor can be
//! exercised without a reachable IoT Hub.

pub mod mocks;

pub use mocks::*;
