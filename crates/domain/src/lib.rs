//! Shared domain types for the MIRA continuum core.
//!
//! Everything here is provider-agnostic and free of I/O: the message and
//! content-block model, stream events, tool shapes, configuration, errors,
//! and the response tag parser.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod tags;
pub mod tool;

pub use error::{Error, Result};
