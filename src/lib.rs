//! Viewcast
//!
//! Per-tick visibility and delta-replication engine for multiplayer game
//! servers. Every tick it works out which entities each observer can see,
//! turns component changes into per-observer full snapshots or deltas, and
//! hands one encoded message per observer to a non-blocking network sink.
//!
//! # Features
//!
//! - `metrics_extended` - Per-stage timings in the metrics output (enabled by default)

pub mod config;
pub mod metrics;
pub mod net;
pub mod replication;
pub mod util;
pub mod world;
