//! Shared protocol definitions for Parley: domain types, the client event
//! surface, the broker bus and client-side reconciliation.

pub mod bus;
pub mod codec;
pub mod event;
pub mod message;
pub mod reconcile;
