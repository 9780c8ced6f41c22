//! # OPC UA → Hub Telemetry Bridge
//!
//! Maintains persistent client sessions to OPC UA servers, subscribes to a
//! configured set of variable nodes and event sources, and forwards shaped
//! telemetry records to a downstream message hub in bounded batches.
//!
//! ## Architecture
//!
//! ```text
//! OPC UA servers → stack seam → reconciler → shaper → hub sender → hub
//!                                   ↑
//!                      node-config store / control API
//! ```
//!
//! The reconciler owns sessions, subscriptions and monitored items and
//! drives them toward the desired model in the node-config store; the hub
//! sender batches shaped records behind a bounded queue so stack callbacks
//! never block.

pub mod config;
pub mod control;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod node_config;
pub mod reconciler;
pub mod shaping;
pub mod stack;
pub mod vault;
