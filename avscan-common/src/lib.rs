//! # avscan common library
//!
//! Shared code for the avscan workspace:
//! - Error and result types
//! - TOML configuration model and loading
//! - Credential resolution

pub mod config;
pub mod error;

pub use error::{Error, Result};
