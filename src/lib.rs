//! Multi-channel sensor recording: session management, JSON-lines channel
//! logs, a local recording store and streaming log-to-CSV conversion.

pub mod config;
pub mod convert;
pub mod error;
pub mod event;
pub mod notify;
pub mod sensor;
pub mod session;
pub mod store;
pub mod writer;
