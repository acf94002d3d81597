//! Live stream relay worker.
//!
//! Polls stream liveness, and for each online channel supervises a graph of
//! ffmpeg processes: ingest, recording, relays, re-encodes and DASH/HLS
//! packaging. Generations are rebuilt with linear backoff until the channel
//! goes offline.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod utils;
