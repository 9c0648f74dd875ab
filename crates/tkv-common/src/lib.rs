//! tkv common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all tkv components.

pub mod config;
pub mod error;
pub mod meta;

pub use config::StoreConfig;
pub use error::{Result, TkvError};
pub use meta::{Meta, Record, Tag};
