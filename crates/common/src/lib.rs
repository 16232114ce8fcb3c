//! Common utilities and types shared across the service registry crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
