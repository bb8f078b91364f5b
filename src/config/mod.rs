//! Configuration module
//!
//! Loads named child presets from .gpif/config.toml

mod preset;

pub use preset::*;
