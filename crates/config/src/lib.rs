//! Process configuration.

mod config;

pub use config::*;
