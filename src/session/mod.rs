//! Child session management module
//!
//! Spawns a line-driven child process and owns its pipes until teardown.

#[allow(clippy::module_inception)]
mod session;

pub use session::*;
