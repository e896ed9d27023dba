//! fxdesk: session/run orchestration core for an FX-options analytics
//! dashboard's chat panel.
//!
//! The remote conversational agent is consumed as an HTTP black box
//! (create thread, create run, poll run status, read thread state); this
//! crate owns the protocol around it: durable thread reuse, bounded
//! polling, response extraction across the backend's inconsistent
//! envelope shapes, and reconciliation of the structured side channel
//! into typed market views and scenario-analysis outputs.

pub mod analysis;
pub mod client;
pub mod config;
pub mod extract;
pub mod logging;
pub mod poller;
pub mod session;
pub mod views;
