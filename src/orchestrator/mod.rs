//! Session orchestration modules.
//!
//! Covers port allocation, workspace provisioning, process liveness,
//! server spawning and readiness, and the get-or-create supervisor that
//! ties them together.

pub mod liveness;
pub mod port_allocator;
pub mod readiness;
pub mod session_manager;
pub mod spawner;
pub mod workspace;
