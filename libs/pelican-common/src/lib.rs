//! PeliCAN Common Library
//!
//! Shared utilities used by the driver core and by whatever host process
//! embeds it: one error type, logging setup and layered configuration.

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use tracing_appender::non_blocking::WorkerGuard;
