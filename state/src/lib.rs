//! relayfee State Management
//!
//! Provides state storage, versioning, and state root computation.
//! Uses a key-value model where state = { key → value }. Writes are staged
//! in a [`StateOverlay`] and committed to the store as one atomic batch.

pub mod store;
pub mod memory;
pub mod overlay;

pub use store::*;
pub use memory::*;
pub use overlay::*;
