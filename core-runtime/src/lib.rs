//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the catalog sync engine:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the cache, sync and service
//! crates depend on. It establishes the logging conventions, the validated
//! engine configuration and the typed event channel used throughout the
//! system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
