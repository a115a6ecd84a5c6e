//! Shared process-level utilities.

pub mod logging;
