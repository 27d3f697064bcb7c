//! Azure IoT Hub message conventions: envelopes and topics

pub mod envelope;
pub mod topics;

pub use envelope::*;
pub use topics::*;
