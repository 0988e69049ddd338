#![forbid(unsafe_code)]

//! `nbhydra` supervises one notebook server per user.
//!
//! A login either reuses the user's running server or provisions a
//! workspace, assigns a stable port, and spawns a fresh one.

pub mod config;
pub mod errors;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
