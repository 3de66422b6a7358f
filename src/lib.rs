//! Bridges upstream channel predictions onto on-chain parimutuel markets.
//!
//! Modules are public so the binary and the integration tests share them.

pub mod api;
pub mod auth;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod mapping;
pub mod market;
pub mod store;
pub mod webhook;
