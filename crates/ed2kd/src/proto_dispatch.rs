//! Client request dispatch for the primary connection.

pub mod error;
pub mod handlers;
