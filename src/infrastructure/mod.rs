//! # Infrastructure Layer
//!
//! Implementations of the sandbox capability defined in the Domain layer.

pub mod sandbox;
