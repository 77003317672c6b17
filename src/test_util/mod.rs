//! In-memory stand-ins for the relay service and for application code. They are used by this
//!  crate's tests, and they are also exported for application testing.

pub mod handler;
pub mod service;
