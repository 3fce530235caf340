//! # Blueprint
//!
//! Streaming artifact protocol: turns a model's streamed response into ordered file and
//! command steps and applies them, exactly once, to a sandbox.
//!
//! - Domain: types, configuration, errors and the sandbox capability
//! - Application: parser, reconciler, engine, shadow store, differ, pipeline, logging
//! - Infrastructure: local and in-memory sandboxes

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod strings;
