//! Reads the temperature streamed by an ESP32 over BLE notifications and
//! keeps the link alive by rescanning whenever it drops.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use domain::models::{AppEvent, ConnectionState, SensorCommand, TemperatureReading};
pub use error::SensorError;
pub use infrastructure::bluetooth::SensorService;
