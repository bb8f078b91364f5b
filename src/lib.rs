//! gpif
//!
//! Drives an interactive, line-oriented child process (gnuplot by default)
//! over two anonymous pipes acting as its stdin and stdout.

pub mod config;
pub mod pipe;
pub mod session;

pub use session::{Session, SessionConfig, SessionError, SessionResult};
