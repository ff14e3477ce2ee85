use crate::infrastructure::bluetooth::connection::TargetProfile;
use crate::infrastructure::bluetooth::protocol::{
    self, parse_uuid, DecodeMode, TemperatureDecoder, ThermistorCalibration,
};
use crate::infrastructure::bluetooth::scanner::ScanFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "esp32_thermometer".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Target device
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_temperature_uuid")]
    pub ble_temperature_char_uuid: String,
    #[serde(default = "default_ccc_uuid")]
    pub ble_ccc_descriptor_uuid: String,

    // Scanning
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    // Decoding
    #[serde(default)]
    pub decode_mode: DecodeMode,
    #[serde(default)]
    pub calibration: ThermistorCalibration,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            ble_service_uuid: default_service_uuid(),
            ble_temperature_char_uuid: default_temperature_uuid(),
            ble_ccc_descriptor_uuid: default_ccc_uuid(),
            scan_timeout_ms: default_scan_timeout_ms(),
            decode_mode: DecodeMode::default(),
            calibration: ThermistorCalibration::default(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_device_name() -> String {
    protocol::DEVICE_NAME.to_string()
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_temperature_uuid() -> String {
    protocol::TEMPERATURE_CHAR_UUID.to_string()
}
fn default_ccc_uuid() -> String {
    protocol::CCC_DESCRIPTOR_UUID.to_string()
}
fn default_scan_timeout_ms() -> u64 {
    protocol::SCAN_PERIOD_MS
}

impl Settings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn scan_filter(&self) -> anyhow::Result<ScanFilter> {
        Ok(ScanFilter::new(
            self.device_name.clone(),
            parse_uuid(&self.ble_service_uuid)?,
        ))
    }

    pub fn target_profile(&self) -> anyhow::Result<TargetProfile> {
        Ok(TargetProfile {
            service_uuid: parse_uuid(&self.ble_service_uuid)?,
            characteristic_uuid: parse_uuid(&self.ble_temperature_char_uuid)?,
            ccc_descriptor_uuid: parse_uuid(&self.ble_ccc_descriptor_uuid)?,
        })
    }

    pub fn decoder(&self) -> TemperatureDecoder {
        TemperatureDecoder::new(self.decode_mode, self.calibration)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from `path`, falling back to defaults when missing or unreadable
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}: {})",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("Esp32Thermometer");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
