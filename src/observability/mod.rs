//! Observability: structured logging and secret redaction

pub mod logging;
pub mod redact;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use redact::{redact_secrets, redact_token};

// Span macros for structured logging
pub use logging::{session_span, supervisor_span};
