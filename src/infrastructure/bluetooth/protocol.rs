//! ESP32 Thermometer Protocol
//!
//! GATT profile constants and the notification payload decoder for the
//! environmental-sensing firmware running on the ESP32.

use crate::domain::models::TemperatureReading;
use crate::error::SensorError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

/// Environmental Sensing service
pub const SERVICE_UUID: &str = "0000181a-0000-1000-8000-00805f9b34fb";

/// Temperature characteristic - streams the sensor value as notifications
pub const TEMPERATURE_CHAR_UUID: &str = "00002a6e-0000-1000-8000-00805f9b34fb";

/// Client Characteristic Configuration descriptor
pub const CCC_DESCRIPTOR_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// Advertised name of the sensor
pub const DEVICE_NAME: &str = "Henrik's ESP32";

/// Value written to the CCC descriptor to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Default scan window in milliseconds
pub const SCAN_PERIOD_MS: u64 = 10_000;

const KELVIN_OFFSET: f64 = 273.15;
const DIRECT_PAYLOAD_LEN: usize = 8;
const ADC_PAYLOAD_LEN: usize = 2;

/// How a notification payload is interpreted. Must match the firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// 8-byte little-endian f64, already in degrees Celsius
    Direct,
    /// 2-byte little-endian i16 ADC sample from a thermistor divider
    #[default]
    Thermistor,
    /// Pick by payload length (8 => direct, 2 => thermistor)
    Auto,
}

/// B-parameter calibration for the thermistor divider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermistorCalibration {
    #[serde(default = "default_reference_kelvin")]
    pub reference_kelvin: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_adc_full_scale")]
    pub adc_full_scale: f64,
}

impl Default for ThermistorCalibration {
    fn default() -> Self {
        Self {
            reference_kelvin: default_reference_kelvin(),
            beta: default_beta(),
            adc_full_scale: default_adc_full_scale(),
        }
    }
}

fn default_reference_kelvin() -> f64 {
    298.15
}
fn default_beta() -> f64 {
    3380.0
}
fn default_adc_full_scale() -> f64 {
    4095.0
}

/// Turns raw characteristic values into readings. Pure; safe to call from any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemperatureDecoder {
    pub mode: DecodeMode,
    pub calibration: ThermistorCalibration,
}

impl TemperatureDecoder {
    pub fn new(mode: DecodeMode, calibration: ThermistorCalibration) -> Self {
        Self { mode, calibration }
    }

    /// Decode a payload into degrees Celsius
    pub fn decode(&self, payload: &[u8]) -> Result<f64, SensorError> {
        trace!("Raw payload: {:02X?}", payload);

        match self.mode {
            DecodeMode::Direct => decode_direct(payload),
            DecodeMode::Thermistor => decode_thermistor(payload, &self.calibration),
            DecodeMode::Auto => match payload.len() {
                DIRECT_PAYLOAD_LEN => decode_direct(payload),
                ADC_PAYLOAD_LEN => decode_thermistor(payload, &self.calibration),
                len => Err(SensorError::MalformedPayload(format!(
                    "cannot infer encoding from {} bytes",
                    len
                ))),
            },
        }
    }

    /// Decode a payload and stamp it with the current time
    pub fn decode_reading(&self, payload: &[u8]) -> Result<TemperatureReading, SensorError> {
        self.decode(payload).map(TemperatureReading::new)
    }
}

/// Parse an 8-byte little-endian IEEE-754 double
pub fn decode_direct(payload: &[u8]) -> Result<f64, SensorError> {
    let bytes: [u8; DIRECT_PAYLOAD_LEN] = payload.try_into().map_err(|_| {
        SensorError::MalformedPayload(format!(
            "expected {} bytes, got {}",
            DIRECT_PAYLOAD_LEN,
            payload.len()
        ))
    })?;
    Ok(f64::from_le_bytes(bytes))
}

/// Parse a 2-byte little-endian ADC sample and convert it with [`thermistor_celsius`]
pub fn decode_thermistor(
    payload: &[u8],
    calibration: &ThermistorCalibration,
) -> Result<f64, SensorError> {
    let bytes: [u8; ADC_PAYLOAD_LEN] = payload.try_into().map_err(|_| {
        SensorError::MalformedPayload(format!(
            "expected {} bytes, got {}",
            ADC_PAYLOAD_LEN,
            payload.len()
        ))
    })?;
    thermistor_celsius(i16::from_le_bytes(bytes), calibration)
}

/// B-parameter approximation:
///
/// ```text
/// 1/T = 1/T0 + (1/B) * ln(full_scale/adc - 1)
/// ```
///
/// Over the valid range the result rises with `adc`. `adc == full_scale`
/// gives `ln(0) = -inf` and therefore absolute zero. A negative log argument
/// has no real logarithm and is rejected.
pub fn thermistor_celsius(adc: i16, calibration: &ThermistorCalibration) -> Result<f64, SensorError> {
    if adc <= 0 {
        return Err(SensorError::MalformedPayload(format!(
            "ADC sample {} is not positive",
            adc
        )));
    }

    let ratio = calibration.adc_full_scale / f64::from(adc) - 1.0;
    if ratio < 0.0 {
        return Err(SensorError::MalformedPayload(format!(
            "ADC sample {} exceeds full scale {}",
            adc, calibration.adc_full_scale
        )));
    }

    let inverse_kelvin = 1.0 / calibration.reference_kelvin + ratio.ln() / calibration.beta;
    let celsius = 1.0 / inverse_kelvin - KELVIN_OFFSET;

    if celsius.is_nan() {
        return Err(SensorError::MalformedPayload(format!(
            "ADC sample {} has no defined temperature",
            adc
        )));
    }
    Ok(celsius)
}

/// Parse a UUID string from the settings file
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID '{}': {}", uuid_str, e))
}
