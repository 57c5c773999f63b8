use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    // The host owns stdout; console output is opt-in
    #[serde(default = "default_false")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_false")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_false(),
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
    "ble_winrt_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Scanning
    #[serde(default = "default_true")]
    pub scan_active: bool,

    // GATT
    /// Retry a full service enumeration in cached mode when the device is unreachable
    #[serde(default = "default_true")]
    pub retry_unreachable_cached: bool,
    #[serde(default)]
    pub user_description_placeholder: String,
    #[serde(default = "default_true")]
    pub write_with_response: bool,

    // Runtime
    #[serde(default = "default_worker_threads")]
    pub runtime_worker_threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            scan_active: true,
            retry_unreachable_cached: true,
            user_description_placeholder: String::new(),
            write_with_response: true,
            runtime_worker_threads: default_worker_threads(),
        }
    }
}

fn default_worker_threads() -> usize {
    2
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory, writing defaults on first use.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::open(settings_path)
    }

    pub fn open(settings_path: PathBuf) -> anyhow::Result<Self> {
        let service = match Self::load_from_file(&settings_path) {
            Ok(settings) => Self {
                settings,
                settings_path,
            },
            Err(_) => {
                let service = Self {
                    settings: Settings::default(),
                    settings_path,
                };
                // A read-only config directory must not prevent the bridge from loading
                let _ = service.save();
                service
            }
        };
        Ok(service)
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleWinrtBridge");
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }
}
