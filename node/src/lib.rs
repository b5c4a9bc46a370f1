//! relayfee devnet node
//!
//! Hosts one chain's fee module over an in-memory base channel:
//! - Genesis loading
//! - Fee transactions and queries
//! - Devnet channel handshake and packet relay endpoints
//! - HTTP API

mod api;
mod node;
mod runtime;

pub use api::*;
pub use node::*;
pub use runtime::*;
