//! Relayer fee middleware for relayfee
//!
//! Lets anyone attach fees to a packet and pays them out to the relayers
//! that carried it:
//! - Escrow of receive, acknowledgement and timeout fees per packet
//! - Payee registration for relayers on both ends of a channel
//! - Distribution on acknowledgement or timeout, refunds of the unearned rest
//! - Channel middleware that negotiates fee support and wraps acknowledgements
//! - Genesis import and export of the fee state

pub mod types;
pub mod keys;
pub mod bank;
pub mod payee;
pub mod index;
pub mod distribution;
pub mod escrow;
pub mod msgs;
pub mod validator;
pub mod events;
pub mod channel;
pub mod keeper;
pub mod middleware;
pub mod handler;
pub mod genesis;

pub use types::*;
pub use bank::*;
pub use payee::*;
pub use index::*;
pub use distribution::*;
pub use escrow::*;
pub use msgs::*;
pub use validator::*;
pub use events::*;
pub use channel::*;
pub use keeper::*;
pub use middleware::*;
pub use handler::*;
pub use genesis::*;
