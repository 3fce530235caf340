//! # Application Layer
//!
//! The protocol itself: parsing streamed text, reconciling it into steps, executing
//! steps against the sandbox, and reporting user edits back as modifications.

pub mod differ;
pub mod engine;
pub mod logging;
pub mod parsing;
pub mod pipeline;
pub mod reconciler;
pub mod shadow;
