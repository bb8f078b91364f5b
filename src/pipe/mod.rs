//! Pipe transport module
//!
//! Moves bytes across one end of an anonymous pipe, absorbing interrupted
//! system calls and temporary unavailability.

mod transport;

pub use transport::*;
