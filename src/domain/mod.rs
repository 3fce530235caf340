//! # Domain Layer
//!
//! Core definitions, types, and traits of the streaming artifact protocol.
//! Independent of any concrete sandbox, serving as the contract for the other layers.

pub mod config;
pub mod error;
pub mod paths;
pub mod traits;
pub mod types;
