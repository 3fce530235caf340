//! # Strings Module
//!
//! Centralizes model-facing prompt text and log messages.

pub mod logs;
pub mod prompts;
