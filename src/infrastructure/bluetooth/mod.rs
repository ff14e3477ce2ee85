//! Bluetooth Module
//!
//! Keeps a BLE link to the ESP32 thermometer and streams its readings.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SensorService                        │
//! │   (scan -> connect -> rescan on drop; single event loop) │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - filter  │  │ - GATT     │  │ - UUIDs  │
//! │ - timeout │  │   state    │  │ - decode │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       └──────┬───────┘
//!              ▼
//!       ┌────────────┐
//!       │ Transport  │  btleplug, or a recording mock in tests
//!       └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT profile constants and payload decoding
//! - [`transport`] - Event-driven transport trait and event types
//! - [`scanner`] - First-match scan sessions with a cancellable timeout
//! - [`connection`] - Connect / discover / subscribe state machine
//! - [`service`] - Orchestrator driving the reconnect loop
//! - [`btle`] - btleplug implementation of the transport

pub mod btle;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main service for convenience
pub use service::SensorService;
