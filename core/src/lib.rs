//! relayfee Core Library
//!
//! Core types, traits, and abstractions for the relayer fee middleware.
//! This crate provides the foundation for all other relayfee components.

pub mod types;
pub mod channel;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use channel::*;
pub use traits::*;
pub use error::*;
pub use config::*;
