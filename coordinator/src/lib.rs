//! HTLC swap coordinator
//!
//! Coordinates atomic swaps between two independently operated ledgers using
//! hashed-timelock escrows. Either both legs settle or neither does.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod registry;
pub mod settlement;
pub mod state;
pub mod swap;

pub use error::{SwapError, SwapResult};
