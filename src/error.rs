//! # Error Types
//!
//! This module provides the error types used throughout the dvbfan crate.
//! It defines a central error type `FanError` that encapsulates all possible
//! errors that can occur while demultiplexing a transport stream and serving
//! its channels.
//!
//! ## Example Usage
//!
//! ```rust
//! use dvbfan::error::{FanError, Result};
//!
//! fn check_packet(data: &[u8]) -> Result<()> {
//!     if data.len() != 188 {
//!         return Err(FanError::InvalidData("not a TS packet".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the dvbfan crate
#[derive(Error, Debug)]
pub enum FanError {
    /// I/O errors that occur during socket or demux operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors that occur while decoding PSI/SI tables
    #[error("parse error: {0}")]
    Parse(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Errors related to the HTTP unicast protocol surface
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Errors raised while rendering name/IP/port templates
    #[error("template error: {0}")]
    Template(String),

    /// Errors that occur during integer parsing
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// A specialized Result type for dvbfan operations.
///
/// This type is used throughout the crate to handle operations that can
/// produce a `FanError`.
pub type Result<T> = std::result::Result<T, FanError>;
