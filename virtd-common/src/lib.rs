//! # virtd Common
//!
//! Shared utilities for the virtd components.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use virtd_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(machine = "web", "starting...");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
