//! Centralized error handling for the relay worker
//!
//! # Error Categories
//!
//! - **Configuration Errors**: invalid or missing settings, missing transcoder binary
//! - **Pipeline Errors**: subprocess spawn failures and stdio wiring problems
//! - **External Service Errors**: stats and push endpoints
//!
//! Errors raised inside one channel's supervision loop are logged and absorbed
//! there; only configuration errors at startup are fatal.
//!
//! # Usage
//!
//! ```rust
//! use relay_worker::errors::{AppError, AppResult};
//!
//! fn example_function() -> AppResult<String> {
//!     Err(AppError::configuration("ffmpeg_path must not be empty"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for pipeline construction results
pub type PipelineResult<T> = Result<T, PipelineError>;
