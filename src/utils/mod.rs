//! # Utility Modules
//!
//! Supporting utilities for logging and timing.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Deadline helpers for millisecond-resolution operation
//!   timeouts

pub mod logging;
pub mod timeout;
