#![forbid(unsafe_code)]

//! Batch fetch-and-package media downloads.
//!
//! A client posts a list of source URLs; every reference is resolved into a
//! per-request workspace and the results come back either as the single
//! produced file or as a ZIP archive that is streamed while it is being
//! built. The workspace is removed once the response has been delivered or
//! abandoned.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod packager;
pub mod resolver;
pub mod sanitize;
pub mod security;
pub mod server;
pub mod streamer;
pub mod workspace;

pub use error::{Error, Result};
