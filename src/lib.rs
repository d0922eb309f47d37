//! # WTP Bridge Library
//!
//! This crate bridges a microcontroller-driven Water Treatment Plant (WTP)
//! field unit, connected over a byte-oriented serial link, to a PLC
//! reachable over Modbus TCP. The binary (`main.rs`) is a thin CLI around
//! the library; everything with behavior lives here so tests can drive the
//! real engine against in-memory fakes.
//!
//! ## Crate Structure
//!
//! - **`codec`**: the 10-byte serial frame codec — decode/encode, XOR
//!   checksum, and the named flag groups with their pack/unpack pairs.
//! - **`gateway`**: the `PlcGateway` trait and the Modbus TCP
//!   implementation, plus the configurable PLC address map.
//! - **`arbiter`**: the per-cycle override-authority query (`OverrideState`).
//! - **`bridge`**: the cycle engine — Await, Decode, Sync-out, Reply,
//!   Persist — with the backoff/reconnect policy and scoped teardown.
//! - **`serial`**: the async serial seam and the 8N1 open helper.
//! - **`persist`**: the `PersistenceSink` trait with CSV and no-op
//!   implementations.
//! - **`config`**: TOML + environment configuration with plant defaults.
//! - **`error`**: the aggregated `BridgeError` and `Result` alias.
//! - **`logging`**: tracing subscriber initialization.

pub mod arbiter;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod persist;
pub mod serial;
