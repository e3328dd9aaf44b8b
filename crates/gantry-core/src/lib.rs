//! Gantry Core
//!
//! Core domain types, traits, and error handling for Gantry.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod approval;
pub mod duration;
pub mod error;
pub mod events;
pub mod glob;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod trigger;

pub use duration::{parse_duration, parse_timeout};
pub use error::{Error, Result};
pub use glob::Glob;
pub use ids::*;
