//! # nudge-core
//!
//! Core types, traits, task lifecycle, configuration, and error handling
//! for the Nudge reminder engine.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod task;
pub mod traits;
