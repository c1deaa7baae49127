//! Parley server library.
//!
//! The gateway, message service and fan-out layer of a listing-scoped
//! two-party messaging backend, plus the broker hub that connects gateway
//! instances. Exposed for the binaries, tests and embedding.

pub mod api;
pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod hub;
pub mod logging;
pub mod registry;
pub mod service;
pub mod store;
