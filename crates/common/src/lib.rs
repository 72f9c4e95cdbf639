//! Common types shared across Parley components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;
